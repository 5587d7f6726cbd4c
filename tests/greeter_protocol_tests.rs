//! End-to-end greeter protocol scenarios: real wire frames in, real wire
//! frames out, with only the process-forking backend scripted.

use std::path::PathBuf;

use duskdm::greeter::{AuthBackend, ConnectionState, GreeterConnection, GreeterPolicy};
use duskdm::ipc::{AuthResult, SessionSetup};
use duskdm::pam::{PAM_PROMPT_ECHO_OFF, PAM_SUCCESS, PAM_TEXT_INFO};
use duskdm::protocol::{DaemonMessage, GreeterRequest, MessageReader, MAX_API_VERSION};
use duskdm::secret::SecureBuffer;
use duskdm::session::SessionDesc;

#[derive(Default)]
struct SpyBackend {
    begun: Vec<SessionSetup>,
    answers: Vec<Vec<Option<SecureBuffer>>>,
    cancels: usize,
    launches: Vec<(String, String)>,
    guest_launches: Vec<String>,
}

impl AuthBackend for SpyBackend {
    fn begin(&mut self, setup: SessionSetup) -> anyhow::Result<()> {
        self.begun.push(setup);
        Ok(())
    }

    fn respond(&mut self, answers: Vec<Option<SecureBuffer>>) -> anyhow::Result<()> {
        self.answers.push(answers);
        Ok(())
    }

    fn cancel(&mut self) {
        self.cancels += 1;
    }

    fn launch(
        &mut self,
        username: &str,
        desc: &SessionDesc,
        _language: Option<&str>,
    ) -> anyhow::Result<()> {
        self.launches.push((username.to_string(), desc.name.clone()));
        Ok(())
    }

    fn launch_guest(&mut self, desc: &SessionDesc, _language: Option<&str>) -> anyhow::Result<()> {
        self.guest_launches.push(desc.name.clone());
        Ok(())
    }

    fn set_language(&mut self, _username: &str, _language: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn ensure_shared_dir(&mut self, username: &str) -> anyhow::Result<PathBuf> {
        Ok(PathBuf::from("/var/lib/duskdm/data").join(username))
    }
}

struct Harness {
    conn: GreeterConnection<SpyBackend>,
    reader: MessageReader,
    _sessions: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let sessions = tempfile::tempdir().unwrap();
        std::fs::write(
            sessions.path().join("xfce.desktop"),
            "[Desktop Entry]\nName=Xfce Session\nExec=startxfce4\n",
        )
        .unwrap();
        let remote = sessions.path().join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(
            remote.join("xdmcp.desktop"),
            "[Desktop Entry]\nExec=/usr/bin/xdmcp-session\n",
        )
        .unwrap();

        let policy = GreeterPolicy {
            session_service: "duskdm".to_string(),
            autologin_service: "duskdm-autologin".to_string(),
            autologin_user: None,
            allow_guest: true,
            guest_session: "xfce".to_string(),
            default_session: "xfce".to_string(),
            sessions_dir: sessions.path().to_path_buf(),
            remote_sessions_dir: remote,
            tty: Some("/dev/tty7".to_string()),
            xdisplay: Some(":0".to_string()),
            xauth: None,
        };
        Self {
            conn: GreeterConnection::new(policy, SpyBackend::default()),
            reader: MessageReader::new(),
            _sessions: sessions,
        }
    }

    /// Push a request through the real codec, one byte at a time, as a
    /// slow greeter would.
    fn send(&mut self, request: GreeterRequest) {
        let frame = request.encode().unwrap();
        for byte in &frame {
            self.reader.feed(std::slice::from_ref(byte));
        }
        let (message_type, payload) = self.reader.next_frame().unwrap().unwrap();
        let decoded = GreeterRequest::decode_payload(message_type, &payload).unwrap();
        self.conn.handle_request(decoded).unwrap();
    }

    fn replies(&mut self) -> Vec<DaemonMessage> {
        let api = self.conn.api_version();
        self.conn
            .take_outgoing()
            .iter()
            .map(|frame| DaemonMessage::decode(frame, api).unwrap())
            .collect()
    }

    fn connect(&mut self) {
        self.send(GreeterRequest::Connect {
            version: "1.0".to_string(),
            resettable: false,
            api_version: MAX_API_VERSION,
        });
        self.replies();
    }
}

#[test]
fn test_connect_handshake_over_the_wire() {
    let mut h = Harness::new();
    h.send(GreeterRequest::Connect {
        version: "2.3".to_string(),
        resettable: true,
        api_version: 42,
    });
    match h.replies().as_slice() {
        [DaemonMessage::Connected {
            api_version,
            version,
            hints,
        }] => {
            assert_eq!(*api_version, MAX_API_VERSION);
            assert!(!version.is_empty());
            assert!(hints.iter().any(|(k, _)| k == "default-session"));
            assert!(hints
                .iter()
                .any(|(k, v)| k == "has-guest-account" && v == "true"));
        }
        other => panic!("unexpected replies {other:?}"),
    }
    assert!(h.conn.is_resettable());
}

#[test]
fn test_legacy_connect_without_api_fields() {
    // Old greeters send Connect with only the version string. The frame
    // is built by hand because the codec always emits the current form.
    let version = b"0.9";
    let mut frame = Vec::new();
    frame.extend_from_slice(&0u32.to_be_bytes()); // Connect
    frame.extend_from_slice(&(4 + version.len() as u32).to_be_bytes());
    frame.extend_from_slice(&(version.len() as u32).to_be_bytes());
    frame.extend_from_slice(version);

    let mut h = Harness::new();
    h.reader.feed(&frame);
    let (message_type, payload) = h.reader.next_frame().unwrap().unwrap();
    let decoded = GreeterRequest::decode_payload(message_type, &payload).unwrap();
    match &decoded {
        GreeterRequest::Connect {
            version,
            resettable,
            api_version,
        } => {
            assert_eq!(version, "0.9");
            assert!(!resettable);
            assert_eq!(*api_version, 0);
        }
        other => panic!("unexpected request {other:?}"),
    }

    h.conn.handle_request(decoded).unwrap();
    assert_eq!(h.conn.api_version(), 0);
    // The reply must decode as version 0, i.e. without the api field
    match h.replies().as_slice() {
        [DaemonMessage::Connected { api_version, .. }] => assert_eq!(*api_version, 0),
        other => panic!("unexpected replies {other:?}"),
    }
}

#[test]
fn test_full_password_login() {
    let mut h = Harness::new();
    h.connect();

    h.send(GreeterRequest::Authenticate {
        sequence: 1,
        username: "alice".to_string(),
    });
    assert!(h.replies().is_empty(), "no reply until the helper speaks");
    assert_eq!(h.conn.backend().begun.len(), 1);
    let setup = &h.conn.backend().begun[0];
    assert_eq!(setup.username.as_deref(), Some("alice"));
    assert_eq!(setup.tty.as_deref(), Some("/dev/tty7"));
    assert!(setup.do_authenticate);

    h.conn
        .on_prompts(vec![
            (PAM_TEXT_INFO, "Last login: yesterday".to_string()),
            (PAM_PROMPT_ECHO_OFF, "Password: ".to_string()),
        ])
        .unwrap();
    match h.replies().as_slice() {
        [DaemonMessage::PromptAuthentication {
            sequence, prompts, ..
        }] => {
            assert_eq!(*sequence, 1);
            assert_eq!(prompts.len(), 2);
        }
        other => panic!("unexpected replies {other:?}"),
    }

    h.send(GreeterRequest::ContinueAuthentication {
        secrets: vec!["hunter2".to_string()],
    });
    assert_eq!(
        h.conn.backend().answers,
        vec![vec![None, Some(SecureBuffer::from_str("hunter2"))]]
    );

    h.conn
        .on_auth_result(AuthResult {
            username: None,
            complete: true,
            code: PAM_SUCCESS,
            message: String::new(),
        })
        .unwrap();
    match h.replies().as_slice() {
        [DaemonMessage::EndAuthentication {
            sequence,
            username,
            result,
        }] => {
            assert_eq!(*sequence, 1);
            assert_eq!(username, "alice");
            assert_eq!(*result, PAM_SUCCESS);
        }
        other => panic!("unexpected replies {other:?}"),
    }

    h.send(GreeterRequest::StartSession {
        session: "xfce".to_string(),
    });
    match h.replies().as_slice() {
        [DaemonMessage::SessionResult { code }] => assert_eq!(*code, 0),
        other => panic!("unexpected replies {other:?}"),
    }
    assert_eq!(
        h.conn.backend().launches,
        vec![("alice".to_string(), "xfce".to_string())]
    );
    assert_eq!(h.conn.state(), ConnectionState::SessionRequested);
}

#[test]
fn test_new_authentication_supersedes_old() {
    let mut h = Harness::new();
    h.connect();

    h.send(GreeterRequest::Authenticate {
        sequence: 1,
        username: "alice".to_string(),
    });
    h.send(GreeterRequest::Authenticate {
        sequence: 2,
        username: "bob".to_string(),
    });
    // The first helper is cancelled silently; no EndAuthentication for it
    assert!(h.replies().is_empty());
    assert_eq!(h.conn.backend().cancels, 1);
    assert_eq!(h.conn.backend().begun.len(), 2);

    // Late prompts from the dead helper route to the live authentication
    h.conn
        .on_prompts(vec![(PAM_PROMPT_ECHO_OFF, "Password: ".to_string())])
        .unwrap();
    match h.replies().as_slice() {
        [DaemonMessage::PromptAuthentication { sequence, .. }] => assert_eq!(*sequence, 2),
        other => panic!("unexpected replies {other:?}"),
    }
}

#[test]
fn test_guest_login_end_to_end() {
    let mut h = Harness::new();
    h.connect();

    h.send(GreeterRequest::AuthenticateAsGuest { sequence: 1 });
    assert!(h.conn.backend().begun.is_empty(), "guests skip the helper");
    match h.replies().as_slice() {
        [DaemonMessage::EndAuthentication { result, .. }] => assert_eq!(*result, PAM_SUCCESS),
        other => panic!("unexpected replies {other:?}"),
    }

    h.send(GreeterRequest::StartSession {
        session: String::new(),
    });
    match h.replies().as_slice() {
        [DaemonMessage::SessionResult { code }] => assert_eq!(*code, 0),
        other => panic!("unexpected replies {other:?}"),
    }
    assert_eq!(h.conn.backend().guest_launches, vec!["xfce".to_string()]);
}

#[test]
fn test_remote_session_pins_the_session_choice() {
    let mut h = Harness::new();
    h.connect();

    h.send(GreeterRequest::AuthenticateRemote {
        sequence: 1,
        session: "xdmcp".to_string(),
        username: "carol".to_string(),
    });
    h.conn
        .on_auth_result(AuthResult {
            username: None,
            complete: true,
            code: PAM_SUCCESS,
            message: String::new(),
        })
        .unwrap();
    h.replies();

    h.send(GreeterRequest::StartSession {
        session: "xfce".to_string(),
    });
    assert_eq!(
        h.conn.backend().launches,
        vec![("carol".to_string(), "xdmcp".to_string())]
    );
}

#[test]
fn test_reset_returns_greeter_to_initial_screen() {
    let mut h = Harness::new();
    h.send(GreeterRequest::Connect {
        version: "1.0".to_string(),
        resettable: true,
        api_version: MAX_API_VERSION,
    });
    h.replies();

    h.send(GreeterRequest::Authenticate {
        sequence: 1,
        username: "alice".to_string(),
    });
    assert!(h.conn.reset().unwrap());
    assert_eq!(h.conn.backend().cancels, 1);
    match h.replies().as_slice() {
        [DaemonMessage::Reset { hints }] => {
            assert!(hints.iter().any(|(k, _)| k == "default-session"))
        }
        other => panic!("unexpected replies {other:?}"),
    }
    assert_eq!(h.conn.state(), ConnectionState::Connected);
}

#[test]
fn test_pipelined_requests_share_one_reader() {
    let mut h = Harness::new();

    let mut bytes = Vec::new();
    bytes.extend_from_slice(
        &GreeterRequest::Connect {
            version: "1.0".to_string(),
            resettable: false,
            api_version: MAX_API_VERSION,
        }
        .encode()
        .unwrap(),
    );
    bytes.extend_from_slice(
        &GreeterRequest::Authenticate {
            sequence: 1,
            username: "alice".to_string(),
        }
        .encode()
        .unwrap(),
    );

    h.reader.feed(&bytes);
    while let Some((message_type, payload)) = h.reader.next_frame().unwrap() {
        let decoded = GreeterRequest::decode_payload(message_type, &payload).unwrap();
        h.conn.handle_request(decoded).unwrap();
    }
    assert_eq!(h.conn.backend().begun.len(), 1);
    match h.replies().as_slice() {
        [DaemonMessage::Connected { .. }] => {}
        other => panic!("unexpected replies {other:?}"),
    }
}
