//! Child process supervision
//!
//! The daemon forks long-lived children (session helpers, greeters) and
//! must notice their death promptly without ever blocking in a signal
//! handler. The handler here does the only async-signal-safe thing it can:
//! it writes `(signum, sender pid)` as eight raw bytes to a non-blocking
//! self-pipe and returns. The daemon's poll loop watches the read end and
//! drains events once back in normal context, where `waitpid` and
//! bookkeeping are safe.
//!
//! Stopping a child is two-stage: SIGTERM, then after a grace period one
//! (and only one) SIGKILL. The kill is driven by the caller's timer, so
//! the supervisor itself never sleeps.

use std::io::Read;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Grace period between SIGTERM and SIGKILL when stopping a child.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Write end of the self-pipe, set once at install time. -1 = not installed.
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// One signal delivery, as recorded by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    pub signum: i32,
    /// Pid of the sending process (0 when the kernel sent it).
    pub pid: i32,
}

impl SignalEvent {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[..4].copy_from_slice(&self.signum.to_ne_bytes());
        buf[4..].copy_from_slice(&self.pid.to_ne_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        Self {
            signum: i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            pid: i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    pub fn signal(&self) -> Option<Signal> {
        Signal::try_from(self.signum).ok()
    }
}

// Async-signal-safe: no allocation, no locks, one write(2). A full pipe
// drops the event; the poll loop always re-reaps with WNOHANG so a lost
// SIGCHLD wakeup cannot lose a child.
extern "C" fn handle_signal(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let pid = if info.is_null() {
        0
    } else {
        unsafe { (*info).si_pid() }
    };
    let event = SignalEvent { signum, pid };
    let buf = event.to_bytes();
    unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len());
    }
}

/// The read side of the signal self-pipe, plus handler installation.
///
/// Install exactly once, early, before any child is forked.
pub struct SignalSource {
    reader: os_pipe::PipeReader,
    partial: Vec<u8>,
}

impl SignalSource {
    /// Create the self-pipe and install handlers for the signals the
    /// daemon cares about.
    pub fn install() -> Result<Self> {
        let (reader, writer) = os_pipe::pipe().context("creating signal pipe")?;
        set_nonblocking(reader.as_raw_fd())?;
        set_nonblocking(writer.as_raw_fd())?;

        SIGNAL_PIPE_WR.store(writer.as_raw_fd(), Ordering::SeqCst);
        // The write end belongs to the handler for the life of the process.
        std::mem::forget(writer);

        let action = SigAction::new(
            SigHandler::SigAction(handle_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        for sig in [
            Signal::SIGCHLD,
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGHUP,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
        ] {
            unsafe {
                signal::sigaction(sig, &action)
                    .with_context(|| format!("installing handler for {sig}"))?;
            }
        }

        Ok(Self {
            reader,
            partial: Vec::new(),
        })
    }

    /// Fd to hand to poll(2).
    pub fn raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub fn borrowed_fd(&self) -> BorrowedFd<'_> {
        // Safety: self owns the reader for at least the returned lifetime.
        unsafe { BorrowedFd::borrow_raw(self.reader.as_raw_fd()) }
    }

    /// Drain all pending events. Never blocks.
    pub fn drain(&mut self) -> Vec<SignalEvent> {
        let mut buf = [0u8; 256];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.partial.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let mut events = Vec::new();
        while self.partial.len() >= SignalEvent::WIRE_SIZE {
            let mut chunk = [0u8; SignalEvent::WIRE_SIZE];
            chunk.copy_from_slice(&self.partial[..SignalEvent::WIRE_SIZE]);
            self.partial.drain(..SignalEvent::WIRE_SIZE);
            events.push(SignalEvent::from_bytes(&chunk));
        }
        events
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // Safety: F_GETFL/F_SETFL on a fd we just created.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error()).context("F_GETFL");
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error()).context("F_SETFL");
    }
    Ok(())
}

/// Reap every child that has exited, without blocking.
///
/// Called after any SIGCHLD wakeup. Returns `(pid, status)` pairs; the
/// caller routes each to whichever supervisor owns that pid.
pub fn reap_children() -> Vec<(Pid, WaitStatus)> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => match status.pid() {
                Some(pid) => reaped.push((pid, status)),
                None => break,
            },
            Err(_) => break, // ECHILD: nothing left to reap
        }
    }
    reaped
}

/// Why a supervised child stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Exited(i32),
    Signalled(i32),
}

impl ExitReason {
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitReason::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(ExitReason::Signalled(sig as i32)),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitReason::Exited(0))
    }
}

/// Supervisor for one forked child.
///
/// Tracks liveness and drives the two-stage stop. The caller owns the
/// event loop; this type only records deadlines and reacts when poked.
pub struct ChildProcess {
    pid: Option<Pid>,
    exit: Option<ExitReason>,
    kill_deadline: Option<Instant>,
    sent_kill: bool,
    grace: Duration,
}

impl ChildProcess {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_STOP_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            pid: None,
            exit: None,
            kill_deadline: None,
            sent_kill: false,
            grace,
        }
    }

    /// Adopt a freshly forked child. Refuses while one is still running.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        if self.is_running() {
            bail!("child {} is still running", self.pid.unwrap());
        }
        self.pid = Some(pid);
        self.exit = None;
        self.kill_deadline = None;
        self.sent_kill = false;
        Ok(())
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some() && self.exit.is_none()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    pub fn signal(&self, sig: Signal) -> Result<()> {
        let pid = self.pid.context("no child to signal")?;
        signal::kill(pid, sig).with_context(|| format!("sending {sig} to {pid}"))?;
        Ok(())
    }

    /// Begin the two-stage stop: SIGTERM now, SIGKILL after the grace
    /// period unless the child exits first. Idempotent while pending.
    pub fn stop(&mut self) {
        if !self.is_running() || self.kill_deadline.is_some() {
            return;
        }
        let _ = self.signal(Signal::SIGTERM);
        self.kill_deadline = Some(Instant::now() + self.grace);
    }

    /// Deadline at which the caller should call [`Self::on_timeout`].
    pub fn kill_deadline(&self) -> Option<Instant> {
        if self.is_running() {
            self.kill_deadline
        } else {
            None
        }
    }

    /// Escalate to SIGKILL if the grace period has elapsed. At most one
    /// SIGKILL is ever sent per stop.
    pub fn on_timeout(&mut self, now: Instant) {
        if !self.is_running() || self.sent_kill {
            return;
        }
        if let Some(deadline) = self.kill_deadline {
            if now >= deadline {
                let _ = self.signal(Signal::SIGKILL);
                self.sent_kill = true;
            }
        }
    }

    /// Route a reaped status to this supervisor. Returns true (and records
    /// the exit) only when the pid matches our child.
    pub fn on_child_exited(&mut self, pid: Pid, status: WaitStatus) -> bool {
        if self.pid != Some(pid) || self.exit.is_some() {
            return false;
        }
        self.exit = ExitReason::from_wait_status(status);
        self.kill_deadline = None;
        self.exit.is_some()
    }

    /// Blocking wait for this child alone. For one-shot helpers where the
    /// caller has nothing else to do.
    pub fn wait_blocking(&mut self) -> Result<ExitReason> {
        let pid = self.pid.context("no child to wait for")?;
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    if let Some(exit) = ExitReason::from_wait_status(status) {
                        self.exit = Some(exit);
                        return Ok(exit);
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).with_context(|| format!("waitpid({pid})")),
            }
        }
    }
}

impl Default for ChildProcess {
    fn default() -> Self {
        Self::new()
    }
}
