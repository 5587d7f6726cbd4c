//! Greeter connection state machine
//!
//! One instance per greeter socket connection. Decoded requests go in,
//! encoded reply frames queue up in an outgoing buffer the event loop
//! drains to the socket. All side effects (forking helpers, touching
//! home directories) go through the [`AuthBackend`] trait, so the whole
//! protocol surface runs in tests against a scripted backend.
//!
//! Connection life cycle:
//!
//! ```text
//! AwaitingConnect --Connect--> Connected --StartSession ok--> SessionRequested
//!        |                         |                              |
//!        +----- hangup/error ------+------------------------------+--> Closed
//! ```
//!
//! At most one authentication is in flight. A new Authenticate request
//! while one is active supersedes it: the old helper is cancelled before
//! the new one starts, so two helpers never hold the PAM stack at once.

use std::collections::VecDeque;
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{DmError, Result};
use crate::ipc::{AuthResult, SessionSetup, XauthRecord};
use crate::pam::{
    style_needs_response, PAM_ABORT, PAM_SUCCESS, PAM_SYSTEM_ERR, PAM_USER_UNKNOWN,
};
use crate::protocol::{DaemonMessage, GreeterRequest, Hints, MAX_API_VERSION, SERVER_VERSION};
use crate::secret::SecureBuffer;
use crate::session::{find_session, valid_session_name, SessionDesc};

/// Everything the state machine needs from the surrounding daemon. The
/// production implementation forks session helpers; tests script it.
pub trait AuthBackend {
    /// Start an authentication helper.
    fn begin(&mut self, setup: SessionSetup) -> anyhow::Result<()>;
    /// Answer the helper's most recent prompt batch.
    fn respond(&mut self, answers: Vec<Option<SecureBuffer>>) -> anyhow::Result<()>;
    /// Tear down the active helper, if any.
    fn cancel(&mut self);
    /// Authorize the authenticated helper to become `desc` for `username`.
    fn launch(
        &mut self,
        username: &str,
        desc: &SessionDesc,
        language: Option<&str>,
    ) -> anyhow::Result<()>;
    /// Start a guest session. No helper exists yet; the backend creates
    /// one that skips credential checks.
    fn launch_guest(&mut self, desc: &SessionDesc, language: Option<&str>) -> anyhow::Result<()>;
    /// Persist a language choice for a real user.
    fn set_language(&mut self, username: &str, language: &str) -> anyhow::Result<()>;
    /// Create (or find) the shared data directory for a user.
    fn ensure_shared_dir(&mut self, username: &str) -> anyhow::Result<PathBuf>;
}

/// Per-seat policy, mostly lifted from [`Config`].
#[derive(Debug, Clone)]
pub struct GreeterPolicy {
    pub session_service: String,
    pub autologin_service: String,
    /// Logins for exactly this account run the autologin PAM stack.
    pub autologin_user: Option<String>,
    pub allow_guest: bool,
    pub guest_session: String,
    pub default_session: String,
    pub sessions_dir: PathBuf,
    pub remote_sessions_dir: PathBuf,
    /// Seat terminal handed to every helper.
    pub tty: Option<String>,
    pub xdisplay: Option<String>,
    pub xauth: Option<XauthRecord>,
}

impl GreeterPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_service: config.session_service.clone(),
            autologin_service: config.autologin_service.clone(),
            autologin_user: config.autologin_user.clone(),
            allow_guest: config.allow_guest,
            guest_session: config.guest_session.clone(),
            default_session: config.default_session.clone(),
            sessions_dir: config.sessions_dir.clone(),
            remote_sessions_dir: config.remote_sessions_dir.clone(),
            tty: None,
            xdisplay: None,
            xauth: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingConnect,
    Connected,
    SessionRequested,
    Closed,
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            ConnectionState::AwaitingConnect => "AwaitingConnect",
            ConnectionState::Connected => "Connected",
            ConnectionState::SessionRequested => "SessionRequested",
            ConnectionState::Closed => "Closed",
        }
    }
}

/// The in-flight (or completed-but-unstarted) authentication.
struct Authentication {
    sequence: u32,
    username: Option<String>,
    is_guest: bool,
    /// Session chosen at AuthenticateRemote time; silently overrides the
    /// name in a later StartSession.
    remote_session: Option<String>,
    /// Most recent prompt batch, still awaiting answers.
    pending: Vec<(i32, String)>,
    result: Option<i32>,
    language: Option<String>,
}

impl Authentication {
    fn new(sequence: u32, username: Option<String>) -> Self {
        Self {
            sequence,
            username,
            is_guest: false,
            remote_session: None,
            pending: Vec::new(),
            result: None,
            language: None,
        }
    }

    fn username_or_empty(&self) -> String {
        self.username.clone().unwrap_or_default()
    }
}

pub struct GreeterConnection<B: AuthBackend> {
    policy: GreeterPolicy,
    backend: B,
    state: ConnectionState,
    api_version: u32,
    resettable: bool,
    auth: Option<Authentication>,
    out: VecDeque<Vec<u8>>,
}

impl<B: AuthBackend> GreeterConnection<B> {
    pub fn new(policy: GreeterPolicy, backend: B) -> Self {
        Self {
            policy,
            backend,
            state: ConnectionState::AwaitingConnect,
            api_version: 0,
            resettable: false,
            auth: None,
            out: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Consume the connection, releasing the backend and whatever helper
    /// processes it still owns.
    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn is_resettable(&self) -> bool {
        self.resettable
    }

    /// Drain the encoded frames queued for the greeter.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.out.drain(..).collect()
    }

    fn send(&mut self, message: &DaemonMessage) -> Result<()> {
        let frame = message.encode(self.api_version)?;
        self.out.push_back(frame);
        Ok(())
    }

    fn hints(&self) -> Hints {
        vec![
            (
                "default-session".to_string(),
                self.policy.default_session.clone(),
            ),
            (
                "has-guest-account".to_string(),
                self.policy.allow_guest.to_string(),
            ),
        ]
    }

    fn require_connected(&self, request: &'static str) -> Result<()> {
        match self.state {
            ConnectionState::Connected | ConnectionState::SessionRequested => Ok(()),
            _ => Err(DmError::InvalidState {
                request,
                state: self.state.name(),
            }),
        }
    }

    /// Cancel whatever authentication is in flight so a new one can start.
    fn supersede(&mut self) {
        if let Some(auth) = self.auth.take() {
            if !auth.is_guest && auth.result.is_none() {
                debug!("superseding authentication #{}", auth.sequence);
                self.backend.cancel();
            }
        }
    }

    fn seat_setup(&self, username: Option<String>) -> SessionSetup {
        SessionSetup {
            service: self.policy.session_service.clone(),
            username,
            do_authenticate: true,
            is_interactive: true,
            class: None,
            tty: self.policy.tty.clone(),
            remote_host: None,
            xdisplay: self.policy.xdisplay.clone(),
            xauth: self.policy.xauth.clone(),
        }
    }

    fn end_authentication(&mut self, sequence: u32, username: String, result: i32) -> Result<()> {
        self.send(&DaemonMessage::EndAuthentication {
            sequence,
            username,
            result,
        })
    }

    /// Process one decoded request. An `Err` return means the channel can
    /// no longer be trusted and must be closed.
    pub fn handle_request(&mut self, request: GreeterRequest) -> Result<()> {
        match request {
            GreeterRequest::Connect {
                version,
                resettable,
                api_version,
            } => self.handle_connect(version, resettable, api_version),
            GreeterRequest::Authenticate { sequence, username } => {
                self.handle_authenticate(sequence, username)
            }
            GreeterRequest::AuthenticateAsGuest { sequence } => self.handle_guest(sequence),
            GreeterRequest::AuthenticateRemote {
                sequence,
                session,
                username,
            } => self.handle_remote(sequence, session, username),
            GreeterRequest::ContinueAuthentication { secrets } => self.handle_continue(secrets),
            GreeterRequest::CancelAuthentication => {
                self.require_connected("CancelAuthentication")?;
                self.supersede();
                Ok(())
            }
            GreeterRequest::StartSession { session } => self.handle_start_session(session),
            GreeterRequest::SetLanguage { language } => self.handle_set_language(language),
            GreeterRequest::EnsureSharedDir { username } => self.handle_shared_dir(username),
        }
    }

    fn handle_connect(&mut self, version: String, resettable: bool, api_version: u32) -> Result<()> {
        if self.state != ConnectionState::AwaitingConnect {
            return Err(DmError::InvalidState {
                request: "Connect",
                state: self.state.name(),
            });
        }
        let effective = api_version.min(MAX_API_VERSION);
        self.api_version = effective;
        self.resettable = resettable;
        self.state = ConnectionState::Connected;
        info!("greeter connected: version {version}, api {effective}, resettable {resettable}");
        self.send(&DaemonMessage::Connected {
            api_version: effective,
            version: SERVER_VERSION.to_string(),
            hints: self.hints(),
        })
    }

    fn handle_authenticate(&mut self, sequence: u32, username: String) -> Result<()> {
        self.require_connected("Authenticate")?;
        self.supersede();

        let username = if username.is_empty() {
            None
        } else {
            Some(username)
        };
        let mut setup = self.seat_setup(username.clone());
        // The configured autologin account goes through the no-prompt
        // PAM stack instead of the interactive one.
        if username.is_some() && username == self.policy.autologin_user {
            setup.service = self.policy.autologin_service.clone();
            setup.is_interactive = false;
        }
        match self.backend.begin(setup) {
            Ok(()) => {
                self.auth = Some(Authentication::new(sequence, username));
                Ok(())
            }
            Err(e) => {
                warn!("starting authentication #{sequence}: {e:#}");
                self.end_authentication(sequence, username.unwrap_or_default(), PAM_SYSTEM_ERR)
            }
        }
    }

    fn handle_guest(&mut self, sequence: u32) -> Result<()> {
        self.require_connected("AuthenticateAsGuest")?;
        self.supersede();

        if !self.policy.allow_guest {
            info!("guest login refused by policy");
            return self.end_authentication(sequence, String::new(), PAM_USER_UNKNOWN);
        }
        // Guests carry no credentials; this is purely a policy decision,
        // no helper runs until the session starts.
        let mut auth = Authentication::new(sequence, None);
        auth.is_guest = true;
        auth.result = Some(PAM_SUCCESS);
        self.auth = Some(auth);
        self.end_authentication(sequence, String::new(), PAM_SUCCESS)
    }

    fn handle_remote(&mut self, sequence: u32, session: String, username: String) -> Result<()> {
        self.require_connected("AuthenticateRemote")?;

        let desc = match find_session(&self.policy.remote_sessions_dir, &session) {
            Ok(Some(desc)) => desc,
            Ok(None) => {
                warn!("unknown remote session {session:?}");
                return self.end_authentication(sequence, username, PAM_SYSTEM_ERR);
            }
            Err(e) => {
                warn!("remote session {session:?} rejected: {e:#}");
                return self.end_authentication(sequence, username, PAM_SYSTEM_ERR);
            }
        };

        self.supersede();
        let username = if username.is_empty() {
            None
        } else {
            Some(username)
        };
        let setup = self.seat_setup(username.clone());
        match self.backend.begin(setup) {
            Ok(()) => {
                let mut auth = Authentication::new(sequence, username);
                auth.remote_session = Some(desc.name);
                self.auth = Some(auth);
                Ok(())
            }
            Err(e) => {
                warn!("starting remote authentication #{sequence}: {e:#}");
                self.end_authentication(sequence, username.unwrap_or_default(), PAM_SYSTEM_ERR)
            }
        }
    }

    fn handle_continue(&mut self, secrets: Vec<String>) -> Result<()> {
        self.require_connected("ContinueAuthentication")?;

        // Off the socket and into locked memory before anything else.
        let mut secrets: Vec<SecureBuffer> =
            secrets.into_iter().map(SecureBuffer::from_string).collect();

        let auth = match self.auth.as_mut() {
            Some(auth) if !auth.is_guest && auth.result.is_none() => auth,
            _ => {
                return Err(DmError::InvalidState {
                    request: "ContinueAuthentication",
                    state: "no active authentication",
                })
            }
        };

        let expected = auth
            .pending
            .iter()
            .filter(|(style, _)| style_needs_response(*style))
            .count();
        if secrets.len() != expected {
            // The greeter answered a batch that no longer exists (or
            // miscounted). The conversation is out of sync; end it.
            let err = DmError::ConversationArity {
                got: secrets.len(),
                expected,
            };
            let sequence = auth.sequence;
            let username = auth.username_or_empty();
            warn!("authentication #{sequence}: {err}");
            self.auth = None;
            self.backend.cancel();
            return self.end_authentication(sequence, username, err.pam_code());
        }

        let mut answers: Vec<Option<SecureBuffer>> = Vec::with_capacity(auth.pending.len());
        let mut next = secrets.drain(..);
        for (style, _) in &auth.pending {
            if style_needs_response(*style) {
                answers.push(next.next());
            } else {
                answers.push(None);
            }
        }
        auth.pending.clear();

        if let Err(e) = self.backend.respond(answers) {
            let auth = self.auth.take();
            self.backend.cancel();
            warn!("relaying answers: {e:#}");
            if let Some(auth) = auth {
                return self.end_authentication(
                    auth.sequence,
                    auth.username_or_empty(),
                    PAM_SYSTEM_ERR,
                );
            }
        }
        Ok(())
    }

    fn handle_start_session(&mut self, session: String) -> Result<()> {
        self.require_connected("StartSession")?;

        let (name, is_guest, is_remote, username, language) = match &self.auth {
            Some(auth) if auth.result == Some(PAM_SUCCESS) => {
                // A remote authentication pinned its session; the name in
                // this request is ignored.
                let name = auth
                    .remote_session
                    .clone()
                    .or_else(|| {
                        if session.is_empty() {
                            None
                        } else {
                            Some(session)
                        }
                    })
                    .unwrap_or_else(|| {
                        if auth.is_guest {
                            self.policy.guest_session.clone()
                        } else {
                            self.policy.default_session.clone()
                        }
                    });
                (
                    name,
                    auth.is_guest,
                    auth.remote_session.is_some(),
                    auth.username_or_empty(),
                    auth.language.clone(),
                )
            }
            _ => {
                warn!("StartSession without a successful authentication");
                return self.send(&DaemonMessage::SessionResult { code: 1 });
            }
        };

        let dir = if is_remote {
            &self.policy.remote_sessions_dir
        } else {
            &self.policy.sessions_dir
        };
        let desc = match find_session(dir, &name) {
            Ok(Some(desc)) => desc,
            Ok(None) => {
                warn!("no session {name:?} in {}", dir.display());
                return self.send(&DaemonMessage::SessionResult { code: 1 });
            }
            Err(e) => {
                warn!("session {name:?} rejected: {e:#}");
                return self.send(&DaemonMessage::SessionResult { code: 1 });
            }
        };

        let launched = if is_guest {
            self.backend.launch_guest(&desc, language.as_deref())
        } else {
            self.backend.launch(&username, &desc, language.as_deref())
        };
        match launched {
            Ok(()) => {
                info!("session {name:?} starting for {username:?}");
                self.state = ConnectionState::SessionRequested;
                self.send(&DaemonMessage::SessionResult { code: 0 })
            }
            Err(e) => {
                warn!("launching session {name:?}: {e:#}");
                self.send(&DaemonMessage::SessionResult { code: 1 })
            }
        }
    }

    fn handle_set_language(&mut self, language: String) -> Result<()> {
        self.require_connected("SetLanguage")?;

        match self.auth.as_mut() {
            Some(auth) if auth.result == Some(PAM_SUCCESS) => {
                auth.language = Some(language.clone());
                if auth.is_guest {
                    // Nothing to persist for a transient account
                    return Ok(());
                }
                if let Some(username) = auth.username.clone() {
                    if let Err(e) = self.backend.set_language(&username, &language) {
                        warn!("saving language for {username}: {e:#}");
                    }
                }
                Ok(())
            }
            _ => {
                warn!("SetLanguage without an authenticated user");
                Ok(())
            }
        }
    }

    fn handle_shared_dir(&mut self, username: String) -> Result<()> {
        self.require_connected("EnsureSharedDir")?;

        if !valid_session_name(&username) {
            warn!("shared dir refused for name {username:?}");
            return self.send(&DaemonMessage::SharedDirResult {
                path: String::new(),
            });
        }
        match self.backend.ensure_shared_dir(&username) {
            Ok(path) => self.send(&DaemonMessage::SharedDirResult {
                path: path.display().to_string(),
            }),
            Err(e) => {
                warn!("shared dir for {username}: {e:#}");
                self.send(&DaemonMessage::SharedDirResult {
                    path: String::new(),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Helper-side events
    // ------------------------------------------------------------------

    /// The helper produced a prompt batch.
    pub fn on_prompts(&mut self, prompts: Vec<(i32, String)>) -> Result<()> {
        let (sequence, username) = match self.auth.as_mut() {
            Some(auth) if !auth.is_guest && auth.result.is_none() => {
                auth.pending = prompts.clone();
                (auth.sequence, auth.username_or_empty())
            }
            // A cancelled helper can still flush prompts; drop them
            _ => return Ok(()),
        };
        self.send(&DaemonMessage::PromptAuthentication {
            sequence,
            username,
            prompts,
        })
    }

    /// The helper reported its final PAM result.
    pub fn on_auth_result(&mut self, outcome: AuthResult) -> Result<()> {
        let (sequence, username) = match self.auth.as_mut() {
            Some(auth) if !auth.is_guest && auth.result.is_none() => {
                auth.result = Some(outcome.code);
                auth.pending.clear();
                // PAM modules may have mapped the login name; adopt it so
                // the launch and the greeter both see the real account.
                if let Some(mapped) = outcome.username {
                    auth.username = Some(mapped);
                }
                if outcome.code != PAM_SUCCESS && !outcome.message.is_empty() {
                    debug!(
                        "authentication #{} failed: {}",
                        auth.sequence, outcome.message
                    );
                }
                (auth.sequence, auth.username_or_empty())
            }
            _ => return Ok(()),
        };
        self.end_authentication(sequence, username, outcome.code)
    }

    /// The helper died without reporting a result.
    pub fn on_helper_died(&mut self) -> Result<()> {
        let (sequence, username) = match self.auth.take() {
            Some(auth) if !auth.is_guest && auth.result.is_none() => {
                (auth.sequence, auth.username_or_empty())
            }
            other => {
                self.auth = other;
                return Ok(());
            }
        };
        warn!("authentication helper died during #{sequence}");
        self.end_authentication(sequence, username, PAM_ABORT)
    }

    /// The greeter hung up.
    pub fn on_hangup(&mut self) {
        info!("greeter disconnected");
        self.supersede();
        self.state = ConnectionState::Closed;
    }

    /// Put a resettable greeter back to its initial screen. Returns false
    /// when the greeter is not resettable and must be dropped instead.
    pub fn reset(&mut self) -> Result<bool> {
        if !self.resettable || self.state == ConnectionState::Closed {
            return Ok(false);
        }
        self.supersede();
        self.state = ConnectionState::Connected;
        let hints = self.hints();
        self.send(&DaemonMessage::Reset { hints })?;
        Ok(true)
    }

    /// Tell the greeter it is visible again and should accept input.
    pub fn notify_idle(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.send(&DaemonMessage::Idle)
    }
}
