//! Seat registrar integration
//!
//! Modern systems register graphical sessions through logind, which hooks
//! in transparently via the PAM session stack; the daemon only needs to
//! detect that logind is running. On systems without it we fall back to a
//! ConsoleKit-style session cookie minted locally and exported as
//! XDG_SESSION_COOKIE so session tooling can correlate processes.
//!
//! Detection follows the sd_booted(3) rule: logind is in charge exactly
//! when /run/systemd/system exists.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registrar {
    /// logind registers the session from inside pam_open_session.
    Logind,
    /// No registrar daemon; carry a locally minted cookie instead.
    LocalCookie { cookie: String },
}

impl Registrar {
    pub fn probe() -> Result<Self> {
        Self::probe_at(Path::new("/run"))
    }

    /// Probe with an explicit /run root, so tests can fake either outcome.
    pub fn probe_at(run_root: &Path) -> Result<Self> {
        if run_root.join("systemd/system").is_dir() {
            Ok(Registrar::Logind)
        } else {
            Ok(Registrar::LocalCookie {
                cookie: mint_cookie()?,
            })
        }
    }

    /// Value for XDG_SESSION_COOKIE, when one applies.
    pub fn session_cookie(&self) -> Option<&str> {
        match self {
            Registrar::Logind => None,
            Registrar::LocalCookie { cookie } => Some(cookie),
        }
    }
}

fn mint_cookie() -> Result<String> {
    let mut bytes = [0u8; 16];
    fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .context("reading /dev/urandom")?;
    let mut cookie = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        cookie.push_str(&format!("{byte:02x}"));
    }
    Ok(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_logind() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("systemd/system")).unwrap();
        assert_eq!(Registrar::probe_at(dir.path()).unwrap(), Registrar::Logind);
    }

    #[test]
    fn test_probe_fallback_mints_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let registrar = Registrar::probe_at(dir.path()).unwrap();
        let cookie = registrar.session_cookie().unwrap();
        assert_eq!(cookie.len(), 32);
        assert!(cookie.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cookies_are_distinct() {
        assert_ne!(mint_cookie().unwrap(), mint_cookie().unwrap());
    }
}
