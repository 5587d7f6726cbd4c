//! Session log files
//!
//! Each session's stdout/stderr goes to a log file (usually
//! ~/.xsession-errors). The previous run's log is either rotated to
//! `<name>.old` or truncated, per configuration. Opening happens in the
//! session child after privileges are dropped, so a hostile symlink in
//! the user's home can only ever clobber the user's own files.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};

/// Open a session log, rotating or truncating any previous one.
pub fn open_session_log(path: &Path, backup: bool) -> Result<File> {
    if backup && path.exists() {
        let mut old = path.as_os_str().to_os_string();
        old.push(".old");
        // Best effort; a failed rotate must not block the session
        let _ = std::fs::rename(path, &old);
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(!backup)
        .append(backup)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("opening session log {}", path.display()))?;
    Ok(file)
}

/// Point stdout and stderr at the log and stdin at /dev/null.
pub fn redirect_stdio(log: &File) -> Result<()> {
    let devnull = File::open("/dev/null").context("opening /dev/null")?;
    // Safety: dup2 onto the standard fds of our own process.
    unsafe {
        if libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO) < 0
            || libc::dup2(log.as_raw_fd(), libc::STDOUT_FILENO) < 0
            || libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO) < 0
        {
            return Err(std::io::Error::last_os_error()).context("redirecting stdio");
        }
    }
    Ok(())
}
