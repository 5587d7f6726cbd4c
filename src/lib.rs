//! duskdm: display-manager daemon core — greeter protocol, PAM
//! authentication over a process boundary, and session launch.

pub mod accounts;
pub mod config;
pub mod daemon;
pub mod error;
pub mod greeter;
pub mod ipc;
pub mod logfile;
pub mod pam;
pub mod process;
pub mod protocol;
pub mod registrar;
pub mod secret;
pub mod session;
pub mod session_child;
pub mod utmp;
pub mod xauthority;
