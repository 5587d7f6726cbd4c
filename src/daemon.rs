//! The daemon event loop
//!
//! Single-threaded poll(2) loop over four kinds of descriptors: the
//! signal self-pipe, the greeter listening socket, the accepted greeter
//! connection, and the pipes of whatever session helpers are alive.
//! Timeouts come from pending SIGTERM→SIGKILL escalations; everything
//! else is event driven.
//!
//! One greeter per socket: a second connection while one is active is
//! accepted and immediately dropped, so a wedged greeter cannot be
//! displaced by a local user racing the socket.
//!
//! Helpers outlive the connection that spawned them: when a greeter goes
//! away its un-reaped helpers move to the daemon's orphan list, which
//! keeps their SIGTERM→SIGKILL escalation running until SIGCHLD arrives.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::chown;

use crate::accounts::UserRecord;
use crate::config::Config;
use crate::greeter::{AuthBackend, ConnectionState, GreeterConnection, GreeterPolicy};
use crate::error::Result as DmResult;
use crate::ipc::{ChildMessage, SessionLaunch, SessionSetup};
use crate::pam::PAM_SUCCESS;
use crate::process::{reap_children, SignalSource};
use crate::protocol::{GreeterRequest, MessageReader};
use crate::secret::{self, SecureBuffer};
use crate::session::{Session, SessionDesc};

/// Production [`AuthBackend`]: forks session helpers and touches the
/// filesystem on behalf of the greeter state machine.
pub struct DaemonBackend {
    config: Config,
    session: Option<Session>,
    /// Helpers told to stop but not yet reaped.
    zombies: Vec<Session>,
    /// Launch data queued until a no-credential helper reports success.
    pending_launch: Option<SessionLaunch>,
}

impl DaemonBackend {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            session: None,
            zombies: Vec::new(),
            pending_launch: None,
        }
    }

    fn active_session(&mut self) -> anyhow::Result<&mut Session> {
        self.session
            .as_mut()
            .context("no authentication helper is running")
    }
}

/// Assemble the launch message for a session command.
fn build_launch(
    config: &Config,
    user: &UserRecord,
    desc: &SessionDesc,
    language: Option<&str>,
) -> SessionLaunch {
    let mut env = vec![format!("DESKTOP_SESSION={}", desc.name)];
    if let Some(language) = language {
        env.push(format!("LANG={language}"));
    }
    SessionLaunch {
        log_path: Some(
            user.home
                .join(".xsession-errors")
                .to_string_lossy()
                .into_owned(),
        ),
        log_backup: config.backup_logs,
        tty: None,
        xauth_path: None,
        env,
        argv: desc.exec.clone(),
    }
}

impl AuthBackend for DaemonBackend {
    fn begin(&mut self, setup: SessionSetup) -> anyhow::Result<()> {
        self.cancel();
        self.session = Some(Session::spawn(&setup)?);
        Ok(())
    }

    fn respond(&mut self, answers: Vec<Option<SecureBuffer>>) -> anyhow::Result<()> {
        self.active_session()?.respond(&answers)
    }

    fn cancel(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop();
            self.zombies.push(session);
        }
        self.pending_launch = None;
    }

    fn launch(
        &mut self,
        username: &str,
        desc: &SessionDesc,
        language: Option<&str>,
    ) -> anyhow::Result<()> {
        let user = UserRecord::lookup(username)?
            .with_context(|| format!("account {username:?} disappeared"))?;
        let launch = build_launch(&self.config, &user, desc, language);
        self.active_session()?.launch(&launch)
    }

    fn launch_guest(&mut self, desc: &SessionDesc, language: Option<&str>) -> anyhow::Result<()> {
        // Guests get a fresh helper on the autologin PAM stack with no
        // credential check; the launch waits until it reports in.
        let guest = UserRecord::lookup("guest")?.context("no guest account on this system")?;
        let setup = SessionSetup {
            service: self.config.autologin_service.clone(),
            username: Some(guest.name.clone()),
            do_authenticate: false,
            is_interactive: false,
            class: None,
            tty: None,
            remote_host: None,
            xdisplay: None,
            xauth: None,
        };
        self.cancel();
        self.session = Some(Session::spawn(&setup)?);
        self.pending_launch = Some(build_launch(&self.config, &guest, desc, language));
        Ok(())
    }

    fn set_language(&mut self, username: &str, language: &str) -> anyhow::Result<()> {
        let user = UserRecord::lookup(username)?
            .with_context(|| format!("account {username:?} disappeared"))?;
        let mut dmrc = user.read_dmrc();
        dmrc.language = Some(language.to_string());
        user.write_dmrc(&dmrc)
    }

    fn ensure_shared_dir(&mut self, username: &str) -> anyhow::Result<PathBuf> {
        let user = UserRecord::lookup(username)?
            .with_context(|| format!("no account {username:?}"))?;
        let path = self.config.shared_data_dir.join(&user.name);
        fs::create_dir_all(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        // root-owned, group writable by the user
        chown(&path, None, Some(user.gid))
            .with_context(|| format!("chowning {}", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o770))
            .with_context(|| format!("setting mode on {}", path.display()))?;
        Ok(path)
    }
}

/// What the poll pass saw, decoupled from the PollFd borrows.
#[derive(Default)]
struct Readiness {
    signals: bool,
    listener: bool,
    greeter: bool,
    greeter_hup: bool,
    session: bool,
}

pub struct Daemon {
    config: Config,
    listener: UnixListener,
    signals: SignalSource,
    greeter: Option<GreeterConnection<DaemonBackend>>,
    stream: Option<UnixStream>,
    reader: MessageReader,
    /// Helpers adopted from dropped greeter connections, kept until
    /// their processes are reaped.
    orphans: Vec<Session>,
    shutdown: bool,
}

/// Decode and dispatch one greeter frame. The payload is zeroed before
/// returning either way: ContinueAuthentication frames carry passwords.
fn dispatch_frame<B: AuthBackend>(
    greeter: &mut GreeterConnection<B>,
    message_type: u32,
    payload: &mut [u8],
) -> DmResult<()> {
    let request = GreeterRequest::decode_payload(message_type, payload);
    secret::wipe_slice(payload);
    greeter.handle_request(request?)
}

/// Move every helper the backend still owns into `orphans`, stopping the
/// active one first. Their escalation timers keep running from there.
fn orphan_helpers(backend: &mut DaemonBackend, orphans: &mut Vec<Session>) {
    if let Some(mut session) = backend.session.take() {
        session.stop();
        orphans.push(session);
    }
    backend.pending_launch = None;
    orphans.append(&mut backend.zombies);
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let signals = SignalSource::install()?;

        if let Some(parent) = config.greeter_socket.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let _ = fs::remove_file(&config.greeter_socket);
        let listener = UnixListener::bind(&config.greeter_socket)
            .with_context(|| format!("binding {}", config.greeter_socket.display()))?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(&config.greeter_socket, fs::Permissions::from_mode(0o660))?;
        info!("listening on {}", config.greeter_socket.display());

        Ok(Self {
            config,
            listener,
            signals,
            greeter: None,
            stream: None,
            reader: MessageReader::new(),
            orphans: Vec::new(),
            shutdown: false,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown {
            let ready = self.wait()?;

            if ready.signals {
                self.handle_signals();
            }
            if ready.listener {
                self.accept_greeter();
            }
            if ready.greeter {
                self.read_greeter();
            }
            if ready.greeter_hup && self.stream.is_some() {
                self.drop_greeter();
            }
            if ready.session {
                self.read_session();
            }
            self.run_timers();
            self.flush_greeter();
        }

        info!("shutting down");
        self.teardown();
        Ok(())
    }

    /// Poll everything we own. Returns which sources are ready.
    fn wait(&mut self) -> Result<Readiness> {
        let timeout = self.next_deadline();
        let mut ready = Readiness::default();

        let session_fd = self
            .greeter
            .as_ref()
            .and_then(|g| g.backend().session.as_ref())
            .map(|s| s.message_fd());

        let mut fds = Vec::with_capacity(4);
        fds.push(PollFd::new(self.signals.borrowed_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        let greeter_index = self.stream.as_ref().map(|stream| {
            fds.push(PollFd::new(stream.as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });
        let session_index = session_fd.map(|fd| {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
            fds.len() - 1
        });

        let timeout = match timeout {
            Some(deadline) => {
                let millis = deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u16::MAX as u128) as u16;
                PollTimeout::from(millis)
            }
            None => PollTimeout::NONE,
        };

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(ready),
            Err(e) => return Err(e).context("poll"),
        }

        let readable = |fd: &PollFd| {
            fd.revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                .unwrap_or(false)
        };
        ready.signals = readable(&fds[0]);
        ready.listener = readable(&fds[1]);
        if let Some(i) = greeter_index {
            ready.greeter = fds[i]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false);
            ready.greeter_hup = fds[i]
                .revents()
                .map(|r| r.intersects(PollFlags::POLLHUP | PollFlags::POLLERR))
                .unwrap_or(false);
        }
        if let Some(i) = session_index {
            ready.session = readable(&fds[i]);
        }
        Ok(ready)
    }

    /// Earliest SIGKILL escalation deadline across all helpers.
    fn next_deadline(&self) -> Option<Instant> {
        let backend = self.greeter.as_ref().map(|g| g.backend());
        backend
            .iter()
            .flat_map(|b| b.session.iter().chain(b.zombies.iter()))
            .chain(self.orphans.iter())
            .filter_map(|s| s.kill_deadline())
            .min()
    }

    fn handle_signals(&mut self) {
        for event in self.signals.drain() {
            match event.signal() {
                Some(nix::sys::signal::Signal::SIGCHLD) => self.reap(),
                Some(nix::sys::signal::Signal::SIGTERM)
                | Some(nix::sys::signal::Signal::SIGINT) => {
                    info!("received {}, stopping", event.signum);
                    self.shutdown = true;
                }
                Some(nix::sys::signal::Signal::SIGHUP) => {
                    info!("received SIGHUP; reloading configuration");
                    self.config = Config::load();
                }
                _ => debug!("ignoring signal {} from pid {}", event.signum, event.pid),
            }
        }
    }

    fn reap(&mut self) {
        let reaped = reap_children();
        for (pid, status) in &reaped {
            self.orphans
                .retain_mut(|orphan| !orphan.on_child_exited(*pid, *status));
        }
        let Some(greeter) = self.greeter.as_mut() else {
            return;
        };
        for (pid, status) in reaped {
            let backend = greeter.backend_mut();
            if let Some(session) = backend.session.as_mut() {
                if session.on_child_exited(pid, status) {
                    debug!("helper {pid} exited: {:?}", session.exit_reason());
                    backend.session = None;
                    backend.pending_launch = None;
                    if let Err(e) = greeter.on_helper_died() {
                        warn!("reporting helper death: {e:#}");
                    }
                    continue;
                }
            }
            greeter
                .backend_mut()
                .zombies
                .retain_mut(|zombie| !zombie.on_child_exited(pid, status));
        }
    }

    fn accept_greeter(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if self.stream.is_some() || self.greeter.is_some() {
                        warn!("rejecting second greeter connection");
                        continue; // dropped on the spot
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("greeter socket setup: {e}");
                        continue;
                    }
                    info!("greeter connection accepted");
                    let backend = DaemonBackend::new(self.config.clone());
                    let policy = GreeterPolicy::from_config(&self.config);
                    self.greeter = Some(GreeterConnection::new(policy, backend));
                    self.stream = Some(stream);
                    self.reader = MessageReader::new();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept: {e}");
                    break;
                }
            }
        }
    }

    fn read_greeter(&mut self) {
        let mut closed = false;
        {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => self.reader.feed(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("greeter read: {e}");
                        closed = true;
                        break;
                    }
                }
            }
            // The read buffer may have held password bytes
            secret::wipe_slice(&mut buf);
        }
        if closed {
            self.drop_greeter();
            return;
        }

        loop {
            match self.reader.next_frame() {
                Ok(Some((message_type, mut payload))) => {
                    let Some(greeter) = self.greeter.as_mut() else {
                        return;
                    };
                    if let Err(e) = dispatch_frame(greeter, message_type, &mut payload) {
                        warn!("greeter request failed: {e}");
                        self.drop_greeter();
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("greeter stream desynchronized: {e}");
                    self.drop_greeter();
                    return;
                }
            }
        }
    }

    fn read_session(&mut self) {
        let Some(greeter) = self.greeter.as_mut() else {
            return;
        };
        let message = {
            let Some(session) = greeter.backend_mut().session.as_mut() else {
                return;
            };
            match session.read_message() {
                Ok(message) => message,
                Err(e) => {
                    debug!("helper channel closed: {e}");
                    // Death is reported via SIGCHLD; nothing to do here
                    return;
                }
            }
        };
        match message {
            ChildMessage::Prompts(prompts) => {
                if let Err(e) = greeter.on_prompts(prompts) {
                    warn!("relaying prompts: {e}");
                    self.drop_greeter();
                }
            }
            ChildMessage::AuthResult(outcome) => {
                if outcome.code == PAM_SUCCESS {
                    // A queued guest/autologin launch goes out now
                    let backend = greeter.backend_mut();
                    if let Some(launch) = backend.pending_launch.take() {
                        if let Some(session) = backend.session.as_mut() {
                            if let Err(e) = session.launch(&launch) {
                                warn!("sending queued launch: {e:#}");
                            }
                        }
                    }
                }
                if let Err(e) = greeter.on_auth_result(outcome) {
                    warn!("relaying result: {e}");
                    self.drop_greeter();
                }
            }
            ChildMessage::Registered(cookie) => {
                debug!("helper registered its session with the seat registrar");
                if let Some(session) = greeter.backend_mut().session.as_mut() {
                    session.set_registration(cookie);
                }
            }
        }
    }

    fn run_timers(&mut self) {
        let now = Instant::now();
        if let Some(greeter) = self.greeter.as_mut() {
            let backend = greeter.backend_mut();
            if let Some(session) = backend.session.as_mut() {
                session.on_timeout(now);
            }
            for zombie in backend.zombies.iter_mut() {
                zombie.on_timeout(now);
            }
        }
        for orphan in self.orphans.iter_mut() {
            orphan.on_timeout(now);
        }
    }

    fn flush_greeter(&mut self) {
        let Some(greeter) = self.greeter.as_mut() else {
            return;
        };
        let frames = greeter.take_outgoing();
        if frames.is_empty() {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        for frame in frames {
            if let Err(e) = stream.write_all(&frame) {
                warn!("greeter write: {e}");
                self.drop_greeter();
                return;
            }
        }
    }

    fn drop_greeter(&mut self) {
        self.stream = None;
        self.reader = MessageReader::new();
        let Some(mut greeter) = self.greeter.take() else {
            return;
        };
        if greeter.state() != ConnectionState::Closed {
            greeter.on_hangup();
        }
        // The connection object goes, its helpers stay with us
        let mut backend = greeter.into_backend();
        orphan_helpers(&mut backend, &mut self.orphans);
    }

    fn teardown(&mut self) {
        if let Some(greeter) = self.greeter.as_mut() {
            let backend = greeter.backend_mut();
            if let Some(session) = backend.session.as_mut() {
                session.stop();
            }
            for zombie in backend.zombies.iter_mut() {
                zombie.stop();
            }
        }
        for orphan in self.orphans.iter_mut() {
            orphan.stop();
        }
        let _ = fs::remove_file(&self.config.greeter_socket);
    }
}
