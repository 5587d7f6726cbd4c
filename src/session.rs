//! Daemon-side session handles
//!
//! Each authentication runs in a separate helper process: the daemon
//! re-execs its own binary with `--session-child` and two inherited pipe
//! fds, then speaks the private channel from [`crate::ipc`] over them.
//! [`Session`] owns that child: the pipes, the pid, and the two-stage
//! stop via [`ChildProcess`].
//!
//! This module also resolves session names to .desktop entries under the
//! configured directories. Names are opaque identifiers; anything that
//! looks like a path is rejected before it touches the filesystem.

use std::fs;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;
use nix::unistd::{fork, ForkResult};

use crate::ipc::{self, ChildMessage, SessionLaunch, SessionSetup};
use crate::process::{ChildProcess, ExitReason};
use crate::secret::SecureBuffer;

/// A running session helper and the channel to it.
pub struct Session {
    child: ChildProcess,
    to_child: os_pipe::PipeWriter,
    from_child: os_pipe::PipeReader,
    /// Cookie the helper reported after registering with the registrar.
    registration: Option<String>,
}

impl Session {
    /// Wrap an already-running helper process and a connected pipe pair.
    pub fn from_parts(
        child: ChildProcess,
        to_child: os_pipe::PipeWriter,
        from_child: os_pipe::PipeReader,
    ) -> Self {
        Session {
            child,
            to_child,
            from_child,
            registration: None,
        }
    }
    /// Fork the helper and send it the setup message.
    pub fn spawn(setup: &SessionSetup) -> Result<Self> {
        // daemon → child and child → daemon
        let (child_read, mut daemon_write) = os_pipe::pipe().context("creating setup pipe")?;
        let (daemon_read, child_write) = os_pipe::pipe().context("creating reply pipe")?;

        match unsafe { fork() }.context("forking session helper")? {
            ForkResult::Child => {
                // dup clears CLOEXEC, so the copies survive the exec
                let read_fd = unsafe { libc::dup(child_read.as_raw_fd()) };
                let write_fd = unsafe { libc::dup(child_write.as_raw_fd()) };
                if read_fd < 0 || write_fd < 0 {
                    unsafe { libc::_exit(1) }
                }
                let arg_read = format!("{read_fd}\0");
                let arg_write = format!("{write_fd}\0");
                let argv: [*const libc::c_char; 5] = [
                    c"duskdm".as_ptr(),
                    c"--session-child".as_ptr(),
                    arg_read.as_ptr() as *const libc::c_char,
                    arg_write.as_ptr() as *const libc::c_char,
                    std::ptr::null(),
                ];
                unsafe {
                    libc::execv(c"/proc/self/exe".as_ptr(), argv.as_ptr());
                    libc::_exit(1)
                }
            }
            ForkResult::Parent { child } => {
                drop(child_read);
                drop(child_write);
                debug!("session helper forked as {child}");

                let mut supervisor = ChildProcess::new();
                supervisor.attach(child)?;

                setup
                    .write(&mut daemon_write)
                    .context("sending session setup")?;

                Ok(Session::from_parts(supervisor, daemon_write, daemon_read))
            }
        }
    }

    /// Fd the event loop polls for child messages.
    pub fn message_fd(&self) -> BorrowedFd<'_> {
        // Safety: self owns the reader for at least the returned lifetime.
        unsafe { BorrowedFd::borrow_raw(self.from_child.as_raw_fd()) }
    }

    /// Read the next prompt batch or the final result. Blocks, so call
    /// only after poll reports the fd readable.
    pub fn read_message(&mut self) -> Result<ChildMessage> {
        Ok(ipc::read_child_message(&mut self.from_child)?)
    }

    /// Answer the child's most recent prompt batch.
    pub fn respond(&mut self, answers: &[Option<SecureBuffer>]) -> Result<()> {
        ipc::write_responses(&mut self.to_child, answers)?;
        Ok(())
    }

    /// Authorize the session: send the withheld launch data.
    pub fn launch(&mut self, launch: &SessionLaunch) -> Result<()> {
        launch.write(&mut self.to_child)?;
        self.to_child.flush()?;
        Ok(())
    }

    /// Record the session id/cookie the helper reported at registration.
    pub fn set_registration(&mut self, cookie: String) {
        self.registration = Some(cookie);
    }

    pub fn registration(&self) -> Option<&str> {
        self.registration.as_deref()
    }

    pub fn pid(&self) -> Option<nix::unistd::Pid> {
        self.child.pid()
    }

    pub fn is_running(&self) -> bool {
        self.child.is_running()
    }

    pub fn stop(&mut self) {
        self.child.stop();
    }

    pub fn kill_deadline(&self) -> Option<std::time::Instant> {
        self.child.kill_deadline()
    }

    pub fn on_timeout(&mut self, now: std::time::Instant) {
        self.child.on_timeout(now);
    }

    pub fn on_child_exited(&mut self, pid: nix::unistd::Pid, status: nix::sys::wait::WaitStatus) -> bool {
        self.child.on_child_exited(pid, status)
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.child.exit_reason()
    }
}

// ============================================================================
// Session .desktop entries
// ============================================================================

/// A resolved session type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDesc {
    pub name: String,
    /// Command line from the Exec key, whitespace-split.
    pub exec: Vec<String>,
}

/// True when a client-supplied session name is safe to append to a
/// directory path.
pub fn valid_session_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != "." && name != ".."
}

/// Resolve `<name>.desktop` under `dir`. `Ok(None)` when no such session
/// exists; `Err` only on a malformed name.
pub fn find_session(dir: &Path, name: &str) -> Result<Option<SessionDesc>> {
    if !valid_session_name(name) {
        bail!("invalid session name {name:?}");
    }
    let path = dir.join(format!("{name}.desktop"));
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    Ok(parse_desktop_exec(&content).map(|exec| SessionDesc {
        name: name.to_string(),
        exec,
    }))
}

fn parse_desktop_exec(content: &str) -> Option<Vec<String>> {
    let mut in_entry = false;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry {
            continue;
        }
        if let Some(value) = line.strip_prefix("Exec=") {
            let exec: Vec<String> = value.split_whitespace().map(|s| s.to_string()).collect();
            if exec.is_empty() {
                return None;
            }
            return Some(exec);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_session_names() {
        assert!(valid_session_name("plasma"));
        assert!(valid_session_name("gnome-xorg"));
        assert!(!valid_session_name(""));
        assert!(!valid_session_name("../etc/shadow"));
        assert!(!valid_session_name("a/b"));
        assert!(!valid_session_name("a\\b"));
        assert!(!valid_session_name("."));
    }

    #[test]
    fn test_find_session() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("sway.desktop"),
            "[Desktop Entry]\nName=Sway\nExec=/usr/bin/sway --unsupported-gpu\n",
        )
        .unwrap();

        let desc = find_session(dir.path(), "sway").unwrap().unwrap();
        assert_eq!(
            desc.exec,
            vec!["/usr/bin/sway".to_string(), "--unsupported-gpu".to_string()]
        );
        assert!(find_session(dir.path(), "missing").unwrap().is_none());
        assert!(find_session(dir.path(), "../sway").is_err());
    }

    #[test]
    fn test_registration_cookie_recorded() {
        let (from_child, mut child_out) = os_pipe::pipe().unwrap();
        let (_child_in, to_child) = os_pipe::pipe().unwrap();
        let mut session = Session::from_parts(ChildProcess::new(), to_child, from_child);
        assert_eq!(session.registration(), None);

        ipc::write_registration(&mut child_out, "0123abcd0123abcd").unwrap();
        match session.read_message().unwrap() {
            ChildMessage::Registered(cookie) => session.set_registration(cookie),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(session.registration(), Some("0123abcd0123abcd"));
    }

    #[test]
    fn test_desktop_exec_outside_entry_section_ignored() {
        assert_eq!(
            parse_desktop_exec("[Other]\nExec=/bin/evil\n[Desktop Entry]\nExec=/bin/ok\n"),
            Some(vec!["/bin/ok".to_string()])
        );
        assert_eq!(parse_desktop_exec("[Desktop Entry]\nName=x\n"), None);
    }
}
