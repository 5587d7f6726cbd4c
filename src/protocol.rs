//! Greeter wire protocol
//!
//! The daemon and greeter exchange length-prefixed, type-tagged binary
//! frames over a Unix stream socket:
//!
//! ```text
//! ┌────────────┬────────────┬──────────────────────┐
//! │  Type      │  Length    │  Payload             │
//! │  (4 bytes) │  (4 bytes) │  (variable length)   │
//! └────────────┴────────────┴──────────────────────┘
//! ```
//!
//! All integers are 4-byte big-endian unsigned. A string field is a u32
//! length followed by raw bytes; an absent string is `length = 0`. Frames
//! are capped at [`MAX_MESSAGE_SIZE`] bytes of payload — oversized strings
//! are rejected outright, never chunked.
//!
//! The transport is a byte stream, so reads are two-phase: consume exactly
//! 8 header bytes to learn the payload length, then block for the
//! remainder. [`MessageReader`] implements that as an explicit state
//! machine.
//!
//! The first message on a channel is always `Connect`; the negotiated API
//! version decides the shape of every later server frame (a version-0
//! `Connected` omits the api_version field that version ≥ 1 carries).

use crate::error::ProtocolError;

/// Maximum payload size of one frame.
pub const MAX_MESSAGE_SIZE: u32 = 1024;

/// Size of the frame header (type + length).
pub const HEADER_SIZE: usize = 8;

/// Protocol API version this daemon speaks at most.
pub const MAX_API_VERSION: u32 = 1;

/// Daemon software version reported in `Connected`.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// Greeter → daemon message types
const REQ_CONNECT: u32 = 0;
const REQ_AUTHENTICATE: u32 = 1;
const REQ_CONTINUE_AUTHENTICATION: u32 = 2;
const REQ_START_SESSION: u32 = 3;
const REQ_CANCEL_AUTHENTICATION: u32 = 4;
const REQ_SET_LANGUAGE: u32 = 5;
const REQ_AUTHENTICATE_AS_GUEST: u32 = 6;
const REQ_AUTHENTICATE_REMOTE: u32 = 7;
const REQ_ENSURE_SHARED_DIR: u32 = 8;

// Daemon → greeter message types
const MSG_CONNECTED: u32 = 0;
const MSG_PROMPT_AUTHENTICATION: u32 = 1;
const MSG_END_AUTHENTICATION: u32 = 2;
const MSG_SESSION_RESULT: u32 = 3;
const MSG_SHARED_DIR_RESULT: u32 = 4;
const MSG_IDLE: u32 = 5;
const MSG_RESET: u32 = 6;

/// Key=value hints sent to the greeter at connect/reset time.
pub type Hints = Vec<(String, String)>;

/// One PAM conversation prompt: `(style, text)`.
pub type Prompt = (i32, String);

/// Messages the greeter sends to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GreeterRequest {
    /// Must be first on the channel. `api_version` is 0 for legacy greeters
    /// whose Connect carries only the version string.
    Connect {
        version: String,
        resettable: bool,
        api_version: u32,
    },
    /// Empty username means "prompt for username".
    Authenticate { sequence: u32, username: String },
    AuthenticateAsGuest { sequence: u32 },
    AuthenticateRemote {
        sequence: u32,
        session: String,
        username: String,
    },
    ContinueAuthentication { secrets: Vec<String> },
    StartSession { session: String },
    CancelAuthentication,
    SetLanguage { language: String },
    EnsureSharedDir { username: String },
}

/// Messages the daemon sends to the greeter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    /// Reply to `Connect`. On the wire a version-0 connection receives the
    /// legacy shape without the api_version field.
    Connected {
        api_version: u32,
        version: String,
        hints: Hints,
    },
    PromptAuthentication {
        sequence: u32,
        username: String,
        prompts: Vec<Prompt>,
    },
    EndAuthentication {
        sequence: u32,
        username: String,
        result: i32,
    },
    /// 0 = session accepted.
    SessionResult { code: u32 },
    SharedDirResult { path: String },
    Idle,
    Reset { hints: Hints },
}

// ============================================================================
// Payload writer
// ============================================================================

struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Wrap the payload in a frame header, enforcing the size cap.
    fn into_frame(self, message_type: u32) -> Result<Vec<u8>, ProtocolError> {
        let length = self.buf.len();
        if length > MAX_MESSAGE_SIZE as usize {
            return Err(ProtocolError::Oversized {
                length: length as u32,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        let mut frame = Vec::with_capacity(HEADER_SIZE + length);
        frame.extend_from_slice(&message_type.to_be_bytes());
        frame.extend_from_slice(&(length as u32).to_be_bytes());
        frame.extend_from_slice(&self.buf);
        Ok(frame)
    }
}

// ============================================================================
// Payload reader
// ============================================================================

struct PayloadReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        if self.remaining() < 4 {
            return Err(ProtocolError::Truncated {
                needed: self.offset + 4,
                have: self.buf.len(),
            });
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.offset..self.offset + 4]);
        self.offset += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u32()? != 0)
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let length = self.read_u32()?;
        // The length is attacker-controlled; check it against what is
        // actually present before any allocation is sized from it.
        if length as usize > self.remaining() {
            return Err(ProtocolError::BadString { length });
        }
        let bytes = &self.buf[self.offset..self.offset + length as usize];
        self.offset += length as usize;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_hints(&mut self) -> Result<Hints, ProtocolError> {
        let count = self.read_u32()?;
        let mut hints = Vec::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            hints.push((key, value));
        }
        Ok(hints)
    }
}

fn write_hints(w: &mut PayloadWriter, hints: &Hints) {
    w.write_u32(hints.len() as u32);
    for (key, value) in hints {
        w.write_string(key);
        w.write_string(value);
    }
}

// ============================================================================
// Frame-level decode
// ============================================================================

/// Split a complete frame into `(type, payload)`, validating the header.
///
/// Fails with `Truncated` rather than reading past the supplied buffer,
/// and rejects lengths that would overflow the allocation calculation.
pub fn split_frame(bytes: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: HEADER_SIZE,
            have: bytes.len(),
        });
    }
    let message_type = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if length > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Oversized {
            length,
            limit: MAX_MESSAGE_SIZE,
        });
    }
    let total = HEADER_SIZE
        .checked_add(length as usize)
        .ok_or(ProtocolError::Oversized {
            length,
            limit: MAX_MESSAGE_SIZE,
        })?;
    if bytes.len() < total {
        return Err(ProtocolError::Truncated {
            needed: total,
            have: bytes.len(),
        });
    }
    Ok((message_type, &bytes[HEADER_SIZE..total]))
}

// ============================================================================
// Greeter requests
// ============================================================================

impl GreeterRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = PayloadWriter::new();
        let message_type = match self {
            GreeterRequest::Connect {
                version,
                resettable,
                api_version,
            } => {
                w.write_string(version);
                if *api_version >= 1 {
                    w.write_u32(u32::from(*resettable));
                    w.write_u32(*api_version);
                }
                REQ_CONNECT
            }
            GreeterRequest::Authenticate { sequence, username } => {
                w.write_u32(*sequence);
                w.write_string(username);
                REQ_AUTHENTICATE
            }
            GreeterRequest::AuthenticateAsGuest { sequence } => {
                w.write_u32(*sequence);
                REQ_AUTHENTICATE_AS_GUEST
            }
            GreeterRequest::AuthenticateRemote {
                sequence,
                session,
                username,
            } => {
                w.write_u32(*sequence);
                w.write_string(session);
                w.write_string(username);
                REQ_AUTHENTICATE_REMOTE
            }
            GreeterRequest::ContinueAuthentication { secrets } => {
                w.write_u32(secrets.len() as u32);
                for secret in secrets {
                    w.write_string(secret);
                }
                REQ_CONTINUE_AUTHENTICATION
            }
            GreeterRequest::StartSession { session } => {
                w.write_string(session);
                REQ_START_SESSION
            }
            GreeterRequest::CancelAuthentication => REQ_CANCEL_AUTHENTICATION,
            GreeterRequest::SetLanguage { language } => {
                w.write_string(language);
                REQ_SET_LANGUAGE
            }
            GreeterRequest::EnsureSharedDir { username } => {
                w.write_string(username);
                REQ_ENSURE_SHARED_DIR
            }
        };
        w.into_frame(message_type)
    }

    /// Decode one complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (message_type, payload) = split_frame(bytes)?;
        Self::decode_payload(message_type, payload)
    }

    pub fn decode_payload(message_type: u32, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        match message_type {
            REQ_CONNECT => {
                let version = r.read_string()?;
                // A legacy Connect ends after the version string.
                let (resettable, api_version) = if r.remaining() > 0 {
                    (r.read_bool()?, r.read_u32()?)
                } else {
                    (false, 0)
                };
                Ok(GreeterRequest::Connect {
                    version,
                    resettable,
                    api_version,
                })
            }
            REQ_AUTHENTICATE => Ok(GreeterRequest::Authenticate {
                sequence: r.read_u32()?,
                username: r.read_string()?,
            }),
            REQ_AUTHENTICATE_AS_GUEST => Ok(GreeterRequest::AuthenticateAsGuest {
                sequence: r.read_u32()?,
            }),
            REQ_AUTHENTICATE_REMOTE => Ok(GreeterRequest::AuthenticateRemote {
                sequence: r.read_u32()?,
                session: r.read_string()?,
                username: r.read_string()?,
            }),
            REQ_CONTINUE_AUTHENTICATION => {
                let count = r.read_u32()?;
                let mut secrets = Vec::new();
                for _ in 0..count {
                    secrets.push(r.read_string()?);
                }
                Ok(GreeterRequest::ContinueAuthentication { secrets })
            }
            REQ_START_SESSION => Ok(GreeterRequest::StartSession {
                session: r.read_string()?,
            }),
            REQ_CANCEL_AUTHENTICATION => Ok(GreeterRequest::CancelAuthentication),
            REQ_SET_LANGUAGE => Ok(GreeterRequest::SetLanguage {
                language: r.read_string()?,
            }),
            REQ_ENSURE_SHARED_DIR => Ok(GreeterRequest::EnsureSharedDir {
                username: r.read_string()?,
            }),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

// ============================================================================
// Daemon messages
// ============================================================================

impl DaemonMessage {
    /// Encode for a connection negotiated at `api_version`.
    pub fn encode(&self, api_version: u32) -> Result<Vec<u8>, ProtocolError> {
        let mut w = PayloadWriter::new();
        let message_type = match self {
            DaemonMessage::Connected {
                api_version: effective,
                version,
                hints,
            } => {
                if *effective >= 1 {
                    w.write_u32(*effective);
                }
                w.write_string(version);
                write_hints(&mut w, hints);
                MSG_CONNECTED
            }
            DaemonMessage::PromptAuthentication {
                sequence,
                username,
                prompts,
            } => {
                w.write_u32(*sequence);
                w.write_string(username);
                w.write_u32(prompts.len() as u32);
                for (style, text) in prompts {
                    w.write_u32(*style as u32);
                    w.write_string(text);
                }
                MSG_PROMPT_AUTHENTICATION
            }
            DaemonMessage::EndAuthentication {
                sequence,
                username,
                result,
            } => {
                w.write_u32(*sequence);
                w.write_string(username);
                w.write_u32(*result as u32);
                MSG_END_AUTHENTICATION
            }
            DaemonMessage::SessionResult { code } => {
                w.write_u32(*code);
                MSG_SESSION_RESULT
            }
            DaemonMessage::SharedDirResult { path } => {
                w.write_string(path);
                MSG_SHARED_DIR_RESULT
            }
            DaemonMessage::Idle => MSG_IDLE,
            DaemonMessage::Reset { hints } => {
                write_hints(&mut w, hints);
                MSG_RESET
            }
        };
        let _ = api_version;
        w.into_frame(message_type)
    }

    /// Decode one complete frame as seen by a greeter speaking `api_version`.
    pub fn decode(bytes: &[u8], api_version: u32) -> Result<Self, ProtocolError> {
        let (message_type, payload) = split_frame(bytes)?;
        let mut r = PayloadReader::new(payload);
        match message_type {
            MSG_CONNECTED => {
                let effective = if api_version >= 1 { r.read_u32()? } else { 0 };
                Ok(DaemonMessage::Connected {
                    api_version: effective,
                    version: r.read_string()?,
                    hints: r.read_hints()?,
                })
            }
            MSG_PROMPT_AUTHENTICATION => {
                let sequence = r.read_u32()?;
                let username = r.read_string()?;
                let count = r.read_u32()?;
                let mut prompts = Vec::new();
                for _ in 0..count {
                    let style = r.read_u32()? as i32;
                    let text = r.read_string()?;
                    prompts.push((style, text));
                }
                Ok(DaemonMessage::PromptAuthentication {
                    sequence,
                    username,
                    prompts,
                })
            }
            MSG_END_AUTHENTICATION => Ok(DaemonMessage::EndAuthentication {
                sequence: r.read_u32()?,
                username: r.read_string()?,
                result: r.read_u32()? as i32,
            }),
            MSG_SESSION_RESULT => Ok(DaemonMessage::SessionResult {
                code: r.read_u32()?,
            }),
            MSG_SHARED_DIR_RESULT => Ok(DaemonMessage::SharedDirResult {
                path: r.read_string()?,
            }),
            MSG_IDLE => Ok(DaemonMessage::Idle),
            MSG_RESET => Ok(DaemonMessage::Reset {
                hints: r.read_hints()?,
            }),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

// ============================================================================
// Incremental reader
// ============================================================================

/// Where the reader is in the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AwaitingHeader,
    AwaitingBody { message_type: u32, length: u32 },
}

/// Incremental frame reader over a byte stream.
///
/// Feed arbitrary chunks in; complete `(type, payload)` frames come out.
/// Every header is validated against [`MAX_MESSAGE_SIZE`] before any body
/// buffering happens.
pub struct MessageReader {
    state: ReadState,
    buf: Vec<u8>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            state: ReadState::AwaitingHeader,
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<(u32, Vec<u8>)>, ProtocolError> {
        loop {
            match self.state {
                ReadState::AwaitingHeader => {
                    if self.buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let message_type =
                        u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                    let length =
                        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);
                    if length > MAX_MESSAGE_SIZE {
                        return Err(ProtocolError::Oversized {
                            length,
                            limit: MAX_MESSAGE_SIZE,
                        });
                    }
                    self.state = ReadState::AwaitingBody {
                        message_type,
                        length,
                    };
                }
                ReadState::AwaitingBody {
                    message_type,
                    length,
                } => {
                    let total = HEADER_SIZE + length as usize;
                    if self.buf.len() < total {
                        return Ok(None);
                    }
                    let payload = self.buf[HEADER_SIZE..total].to_vec();
                    // drain() moves the tail but never clears the spare
                    // capacity; zero the frame bytes first, they may
                    // hold a password
                    crate::secret::wipe_slice(&mut self.buf[..total]);
                    self.buf.drain(..total);
                    self.state = ReadState::AwaitingHeader;
                    return Ok(Some((message_type, payload)));
                }
            }
        }
    }
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}
