//! Private daemon ↔ session-child channel
//!
//! The session child is spawned with two inherited pipe fds and speaks a
//! trusted, host-local format: native-endian integers, strings as an i32
//! length followed by raw bytes, with `-1` meaning "absent" (distinct from
//! an empty string). Both ends are the same binary, so no cross-host
//! portability is needed. String lengths are still capped at
//! [`MAX_STRING_LENGTH`] so a desynchronised stream cannot trigger a huge
//! allocation.
//!
//! The exchange runs in phases:
//!
//! 1. setup      — daemon → child: service, username, flags, tty, X data
//! 2. converse   — child → daemon: prompt batches; daemon → child: answers
//! 3. result     — child → daemon: PAM-mapped username, completion flag,
//!                 final PAM code and its strerror text
//! 4. launch     — daemon → child: log file, environment, argv (withheld
//!                 until the session is actually authorized to start);
//!                 once registered, the child reports the session cookie
//!                 back on the same stream

use std::io::{Read, Write};

use crate::error::{DmError, ProtocolError, Result};
use crate::secret::{self, SecureBuffer};

/// Setup message version; both ends must agree exactly.
pub const IPC_VERSION: i32 = 1;

/// Cap on any single string field.
pub const MAX_STRING_LENGTH: i32 = 65535;

/// An X authority record forwarded to the child so it can write the user's
/// authority file and hand the cookie to PAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XauthRecord {
    pub family: u16,
    pub address: Vec<u8>,
    pub number: String,
    pub name: String,
    pub data: Vec<u8>,
}

/// Phase 1: everything the child needs to run the PAM stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub service: String,
    pub username: Option<String>,
    pub do_authenticate: bool,
    pub is_interactive: bool,
    pub class: Option<String>,
    pub tty: Option<String>,
    pub remote_host: Option<String>,
    pub xdisplay: Option<String>,
    pub xauth: Option<XauthRecord>,
}

/// Phase 4: everything the child needs to become the user's session.
/// Deliberately not sent until the daemon has decided the session may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLaunch {
    pub log_path: Option<String>,
    /// Rotate an existing log to .old instead of truncating it.
    pub log_backup: bool,
    pub tty: Option<String>,
    pub xauth_path: Option<String>,
    pub env: Vec<String>,
    pub argv: Vec<String>,
}

/// Session class marker for greeter sessions; these skip utmp accounting.
pub const CLASS_GREETER: &str = "greeter";

// ============================================================================
// Primitives
// ============================================================================

pub fn write_i32<W: Write>(w: &mut W, value: i32) -> Result<()> {
    w.write_all(&value.to_ne_bytes())?;
    Ok(())
}

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(i32::from_ne_bytes(bytes))
}

pub fn write_string<W: Write>(w: &mut W, value: Option<&str>) -> Result<()> {
    match value {
        None => write_i32(w, -1),
        Some(s) => {
            let len = s.len() as i32;
            if len > MAX_STRING_LENGTH {
                return Err(DmError::Protocol(ProtocolError::BadString {
                    length: s.len() as u32,
                }));
            }
            write_i32(w, len)?;
            w.write_all(s.as_bytes())?;
            Ok(())
        }
    }
}

pub fn read_string<R: Read>(r: &mut R) -> Result<Option<String>> {
    let len = read_i32(r)?;
    if len < 0 {
        return Ok(None);
    }
    if len > MAX_STRING_LENGTH {
        return Err(DmError::Protocol(ProtocolError::BadString {
            length: len as u32,
        }));
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    let s = String::from_utf8(bytes).map_err(|_| DmError::Protocol(ProtocolError::InvalidUtf8))?;
    Ok(Some(s))
}

fn write_bytes<W: Write>(w: &mut W, value: &[u8]) -> Result<()> {
    if value.len() as i32 > MAX_STRING_LENGTH {
        return Err(DmError::Protocol(ProtocolError::BadString {
            length: value.len() as u32,
        }));
    }
    write_i32(w, value.len() as i32)?;
    w.write_all(value)?;
    Ok(())
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_i32(r)?;
    if !(0..=MAX_STRING_LENGTH).contains(&len) {
        return Err(DmError::Protocol(ProtocolError::BadString {
            length: len as u32,
        }));
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn write_bool<W: Write>(w: &mut W, value: bool) -> Result<()> {
    write_i32(w, i32::from(value))
}

fn read_bool<R: Read>(r: &mut R) -> Result<bool> {
    Ok(read_i32(r)? != 0)
}

// ============================================================================
// Phase 1: setup
// ============================================================================

impl SessionSetup {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_i32(w, IPC_VERSION)?;
        write_string(w, Some(&self.service))?;
        write_string(w, self.username.as_deref())?;
        write_bool(w, self.do_authenticate)?;
        write_bool(w, self.is_interactive)?;
        write_string(w, self.class.as_deref())?;
        write_string(w, self.tty.as_deref())?;
        write_string(w, self.remote_host.as_deref())?;
        write_string(w, self.xdisplay.as_deref())?;
        match &self.xauth {
            None => write_bool(w, false)?,
            Some(record) => {
                write_bool(w, true)?;
                write_i32(w, i32::from(record.family))?;
                write_bytes(w, &record.address)?;
                write_string(w, Some(&record.number))?;
                write_string(w, Some(&record.name))?;
                write_bytes(w, &record.data)?;
            }
        }
        w.flush()?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let version = read_i32(r)?;
        if version != IPC_VERSION {
            return Err(DmError::Protocol(ProtocolError::UnknownType(
                version as u32,
            )));
        }
        let service = read_string(r)?.unwrap_or_default();
        let username = read_string(r)?;
        let do_authenticate = read_bool(r)?;
        let is_interactive = read_bool(r)?;
        let class = read_string(r)?;
        let tty = read_string(r)?;
        let remote_host = read_string(r)?;
        let xdisplay = read_string(r)?;
        let xauth = if read_bool(r)? {
            Some(XauthRecord {
                family: read_i32(r)? as u16,
                address: read_bytes(r)?,
                number: read_string(r)?.unwrap_or_default(),
                name: read_string(r)?.unwrap_or_default(),
                data: read_bytes(r)?,
            })
        } else {
            None
        };
        Ok(SessionSetup {
            service,
            username,
            do_authenticate,
            is_interactive,
            class,
            tty,
            remote_host,
            xdisplay,
            xauth,
        })
    }
}

// ============================================================================
// Phase 2/3: child → daemon messages
// ============================================================================

// Tags on the child → daemon stream, so the daemon can tell a prompt
// batch from the final result without tracking conversation state.
const CHILD_MSG_PROMPTS: i32 = 0;
const CHILD_MSG_RESULT: i32 = 1;
const CHILD_MSG_REGISTERED: i32 = 2;

/// The final verdict of one PAM transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// PAM_USER after the stack ran; modules may have mapped the name the
    /// greeter sent to a different account.
    pub username: Option<String>,
    /// Whether the conversation ran to completion.
    pub complete: bool,
    pub code: i32,
    /// `pam_strerror` text for `code`.
    pub message: String,
}

/// A message arriving from the session child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildMessage {
    /// PAM wants these shown/answered, in order.
    Prompts(Vec<(i32, String)>),
    /// Final result of the transaction.
    AuthResult(AuthResult),
    /// The session id/cookie minted when the session was registered.
    Registered(String),
}

/// Child → daemon: one batch of PAM conversation messages.
pub fn write_prompts<W: Write>(w: &mut W, prompts: &[(i32, String)]) -> Result<()> {
    write_i32(w, CHILD_MSG_PROMPTS)?;
    write_i32(w, prompts.len() as i32)?;
    for (style, text) in prompts {
        write_i32(w, *style)?;
        write_string(w, Some(text))?;
    }
    w.flush()?;
    Ok(())
}

fn read_prompts_body<R: Read>(r: &mut R) -> Result<Vec<(i32, String)>> {
    let count = read_i32(r)?;
    if !(0..=MAX_STRING_LENGTH).contains(&count) {
        return Err(DmError::Protocol(ProtocolError::BadString {
            length: count as u32,
        }));
    }
    let mut prompts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let style = read_i32(r)?;
        let text = read_string(r)?.unwrap_or_default();
        prompts.push((style, text));
    }
    Ok(prompts)
}

/// Daemon side: read whatever the child sent next.
pub fn read_child_message<R: Read>(r: &mut R) -> Result<ChildMessage> {
    match read_i32(r)? {
        CHILD_MSG_PROMPTS => Ok(ChildMessage::Prompts(read_prompts_body(r)?)),
        CHILD_MSG_RESULT => Ok(ChildMessage::AuthResult(AuthResult {
            username: read_string(r)?,
            complete: read_bool(r)?,
            code: read_i32(r)?,
            message: read_string(r)?.unwrap_or_default(),
        })),
        CHILD_MSG_REGISTERED => Ok(ChildMessage::Registered(
            read_string(r)?.unwrap_or_default(),
        )),
        other => Err(DmError::Protocol(ProtocolError::UnknownType(other as u32))),
    }
}

/// Daemon → child: one answer per prompt in the batch, in order.
/// `None` answers the display-only messages which take no response.
/// Answers stay in locked buffers on both sides of the pipe.
pub fn write_responses<W: Write>(w: &mut W, responses: &[Option<SecureBuffer>]) -> Result<()> {
    write_i32(w, responses.len() as i32)?;
    for response in responses {
        match response {
            None => write_i32(w, -1)?,
            Some(answer) => write_bytes(w, answer.as_bytes())?,
        }
    }
    w.flush()?;
    Ok(())
}

pub fn read_responses<R: Read>(r: &mut R, expected: usize) -> Result<Vec<Option<SecureBuffer>>> {
    let count = read_i32(r)?;
    if count as usize != expected {
        return Err(DmError::ConversationArity {
            got: count as usize,
            expected,
        });
    }
    let mut responses = Vec::with_capacity(expected);
    for _ in 0..count {
        let len = read_i32(r)?;
        if len < 0 {
            responses.push(None);
            continue;
        }
        if len > MAX_STRING_LENGTH {
            return Err(DmError::Protocol(ProtocolError::BadString {
                length: len as u32,
            }));
        }
        let mut bytes = vec![0u8; len as usize];
        r.read_exact(&mut bytes)?;
        let answer = SecureBuffer::from_bytes(&bytes);
        secret::wipe_slice(&mut bytes);
        responses.push(Some(answer));
    }
    Ok(responses)
}

// ============================================================================
// Phase 3: result
// ============================================================================

pub fn write_auth_result<W: Write>(w: &mut W, result: &AuthResult) -> Result<()> {
    write_i32(w, CHILD_MSG_RESULT)?;
    write_string(w, result.username.as_deref())?;
    write_bool(w, result.complete)?;
    write_i32(w, result.code)?;
    write_string(w, Some(&result.message))?;
    w.flush()?;
    Ok(())
}

/// Child → daemon: the cookie minted when the session was registered with
/// the seat registrar, so the daemon can tie the session to it.
pub fn write_registration<W: Write>(w: &mut W, cookie: &str) -> Result<()> {
    write_i32(w, CHILD_MSG_REGISTERED)?;
    write_string(w, Some(cookie))?;
    w.flush()?;
    Ok(())
}

// ============================================================================
// Phase 4: launch
// ============================================================================

fn write_string_list<W: Write>(w: &mut W, list: &[String]) -> Result<()> {
    write_i32(w, list.len() as i32)?;
    for item in list {
        write_string(w, Some(item))?;
    }
    Ok(())
}

fn read_string_list<R: Read>(r: &mut R) -> Result<Vec<String>> {
    let count = read_i32(r)?;
    if !(0..=MAX_STRING_LENGTH).contains(&count) {
        return Err(DmError::Protocol(ProtocolError::BadString {
            length: count as u32,
        }));
    }
    let mut list = Vec::with_capacity(count as usize);
    for _ in 0..count {
        list.push(read_string(r)?.unwrap_or_default());
    }
    Ok(list)
}

impl SessionLaunch {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        write_string(w, self.log_path.as_deref())?;
        write_bool(w, self.log_backup)?;
        write_string(w, self.tty.as_deref())?;
        write_string(w, self.xauth_path.as_deref())?;
        write_string_list(w, &self.env)?;
        write_string_list(w, &self.argv)?;
        w.flush()?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        Ok(SessionLaunch {
            log_path: read_string(r)?,
            log_backup: read_bool(r)?,
            tty: read_string(r)?,
            xauth_path: read_string(r)?,
            env: read_string_list(r)?,
            argv: read_string_list(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_string_absent_vs_empty() {
        let mut buf = Vec::new();
        write_string(&mut buf, None).unwrap();
        write_string(&mut buf, Some("")).unwrap();
        write_string(&mut buf, Some("tty7")).unwrap();

        let mut r = Cursor::new(buf);
        assert_eq!(read_string(&mut r).unwrap(), None);
        assert_eq!(read_string(&mut r).unwrap(), Some(String::new()));
        assert_eq!(read_string(&mut r).unwrap(), Some("tty7".to_string()));
    }

    #[test]
    fn test_string_over_cap_rejected() {
        let long = "x".repeat(MAX_STRING_LENGTH as usize + 1);
        assert!(write_string(&mut Vec::new(), Some(&long)).is_err());

        // A lying on-wire length is caught before any allocation
        let mut buf = Vec::new();
        write_i32(&mut buf, MAX_STRING_LENGTH + 1).unwrap();
        assert!(read_string(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_setup_roundtrip() {
        let setup = SessionSetup {
            service: "duskdm".to_string(),
            username: Some("alice".to_string()),
            do_authenticate: true,
            is_interactive: true,
            class: None,
            tty: Some("/dev/tty7".to_string()),
            remote_host: None,
            xdisplay: Some(":0".to_string()),
            xauth: Some(XauthRecord {
                family: 256,
                address: b"localhost".to_vec(),
                number: "0".to_string(),
                name: "MIT-MAGIC-COOKIE-1".to_string(),
                data: vec![0xde, 0xad, 0xbe, 0xef],
            }),
        };
        let mut buf = Vec::new();
        setup.write(&mut buf).unwrap();
        assert_eq!(SessionSetup::read(&mut Cursor::new(buf)).unwrap(), setup);
    }

    #[test]
    fn test_setup_version_mismatch() {
        let mut buf = Vec::new();
        write_i32(&mut buf, IPC_VERSION + 1).unwrap();
        assert!(SessionSetup::read(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_conversation_phase() {
        let prompts = vec![
            (crate::pam::PAM_PROMPT_ECHO_OFF, "Password: ".to_string()),
            (crate::pam::PAM_TEXT_INFO, "Last login: never".to_string()),
        ];
        let mut buf = Vec::new();
        write_prompts(&mut buf, &prompts).unwrap();
        assert_eq!(
            read_child_message(&mut Cursor::new(buf)).unwrap(),
            ChildMessage::Prompts(prompts)
        );

        let responses = vec![Some(SecureBuffer::from_str("hunter2")), None];
        let mut buf = Vec::new();
        write_responses(&mut buf, &responses).unwrap();
        assert_eq!(
            read_responses(&mut Cursor::new(buf), 2).unwrap(),
            responses
        );
    }

    #[test]
    fn test_auth_result_message() {
        let result = AuthResult {
            username: Some("alice".to_string()),
            complete: true,
            code: crate::pam::PAM_AUTH_ERR,
            message: "Authentication failure".to_string(),
        };
        let mut buf = Vec::new();
        write_auth_result(&mut buf, &result).unwrap();
        assert_eq!(
            read_child_message(&mut Cursor::new(buf)).unwrap(),
            ChildMessage::AuthResult(result)
        );
    }

    #[test]
    fn test_auth_result_without_username() {
        // PAM may finish without ever naming an account.
        let result = AuthResult {
            username: None,
            complete: false,
            code: crate::pam::PAM_AUTH_ERR,
            message: String::new(),
        };
        let mut buf = Vec::new();
        write_auth_result(&mut buf, &result).unwrap();
        assert_eq!(
            read_child_message(&mut Cursor::new(buf)).unwrap(),
            ChildMessage::AuthResult(result)
        );
    }

    #[test]
    fn test_registration_message() {
        let mut buf = Vec::new();
        write_registration(&mut buf, "0123456789abcdef").unwrap();
        assert_eq!(
            read_child_message(&mut Cursor::new(buf)).unwrap(),
            ChildMessage::Registered("0123456789abcdef".to_string())
        );
    }

    #[test]
    fn test_response_arity_mismatch() {
        let mut buf = Vec::new();
        write_responses(&mut buf, &[Some(SecureBuffer::from_str("only-one"))]).unwrap();
        let err = read_responses(&mut Cursor::new(buf), 2).unwrap_err();
        assert!(matches!(
            err,
            DmError::ConversationArity {
                got: 1,
                expected: 2
            }
        ));
    }

    #[test]
    fn test_launch_roundtrip() {
        let launch = SessionLaunch {
            log_path: Some("/home/alice/.xsession-errors".to_string()),
            log_backup: true,
            tty: None,
            xauth_path: Some("/home/alice/.Xauthority".to_string()),
            env: vec!["HOME=/home/alice".to_string(), "USER=alice".to_string()],
            argv: vec!["/usr/bin/startplasma-x11".to_string()],
        };
        let mut buf = Vec::new();
        launch.write(&mut buf).unwrap();
        assert_eq!(SessionLaunch::read(&mut Cursor::new(buf)).unwrap(), launch);
    }

    #[test]
    fn test_empty_argv_means_setcred_only() {
        // An empty command list is a valid launch: the child refreshes
        // credentials and exits instead of execing a session.
        let launch = SessionLaunch {
            log_path: None,
            log_backup: false,
            tty: None,
            xauth_path: None,
            env: vec![],
            argv: vec![],
        };
        let mut buf = Vec::new();
        launch.write(&mut buf).unwrap();
        assert_eq!(SessionLaunch::read(&mut Cursor::new(buf)).unwrap(), launch);
    }
}
