//! Structured error types for the duskdm daemon
//!
//! The taxonomy distinguishes faults that close the greeter channel
//! (protocol violations) from faults that only fail the current
//! authentication attempt (PAM results, helper I/O) and faults that are
//! fatal to a session child (privileged setup).

use thiserror::Error;

use crate::pam::{pam_result_name, PAM_CONV_ERR, PAM_SUCCESS, PAM_SYSTEM_ERR, PAM_USER_UNKNOWN};

/// Errors in the greeter wire protocol. All of these are connection-fatal:
/// the daemon closes the channel rather than trying to resynchronize a
/// byte stream it no longer trusts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The supplied bytes end before the frame does.
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// The declared payload length exceeds the frame cap.
    #[error("oversized frame: {length} bytes (limit {limit})")]
    Oversized { length: u32, limit: u32 },

    /// A string field runs past the end of its payload.
    #[error("malformed frame: string length {length} exceeds remaining payload")]
    BadString { length: u32 },

    /// Unknown message type id for the negotiated protocol version.
    #[error("unknown message type {0}")]
    UnknownType(u32),

    /// Non-UTF-8 bytes in a string field.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}

/// A non-success PAM result code plus the human-readable string PAM gave
/// for it. Surfaced to the greeter as `EndAuthentication`; never fatal to
/// the daemon itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message} ({})", pam_result_name(*.code))]
pub struct PamError {
    pub code: i32,
    pub message: String,
}

impl PamError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The account exists for PAM but not for the OS. Treated like a PAM
    /// failure even when PAM itself succeeded.
    pub fn user_unknown(username: &str) -> Self {
        Self::new(
            PAM_USER_UNKNOWN,
            format!("user \"{username}\" has no local account"),
        )
    }

    pub fn system_err(message: impl Into<String>) -> Self {
        Self::new(PAM_SYSTEM_ERR, message)
    }

    pub fn is_success(&self) -> bool {
        self.code == PAM_SUCCESS
    }
}

/// Errors raised by the daemon core.
#[derive(Debug, Error)]
pub enum DmError {
    /// Malformed traffic from the greeter; close the channel.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication failed with a PAM-style code; the channel stays open.
    #[error("authentication error: {0}")]
    Pam(#[from] PamError),

    /// I/O on the private descriptor pair to a session child. Fatal to the
    /// current attempt only.
    #[error("session child I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A privileged setup step failed after authentication succeeded.
    #[error("privileged setup failed during {step}: {source}")]
    PrivilegeSetup {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Secret count did not match the outstanding prompt count.
    #[error("conversation arity mismatch: got {got} secrets, expected {expected}")]
    ConversationArity { got: usize, expected: usize },

    /// A request arrived in a connection state that does not allow it.
    #[error("request {request} not valid in state {state}")]
    InvalidState {
        request: &'static str,
        state: &'static str,
    },
}

impl DmError {
    /// The PAM-style code reported to the greeter for this failure.
    pub fn pam_code(&self) -> i32 {
        match self {
            DmError::Pam(e) => e.code,
            DmError::ConversationArity { .. } => PAM_CONV_ERR,
            _ => PAM_SYSTEM_ERR,
        }
    }

    pub fn privilege(step: &'static str, source: std::io::Error) -> Self {
        DmError::PrivilegeSetup { step, source }
    }
}

pub type Result<T> = std::result::Result<T, DmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pam_error_display_includes_code_name() {
        let err = PamError::new(PAM_USER_UNKNOWN, "no such user");
        let text = err.to_string();
        assert!(text.contains("no such user"));
        assert!(text.contains("PAM_USER_UNKNOWN"));
    }

    #[test]
    fn test_arity_maps_to_conv_err() {
        let err = DmError::ConversationArity {
            got: 2,
            expected: 1,
        };
        assert_eq!(err.pam_code(), PAM_CONV_ERR);
    }

    #[test]
    fn test_protocol_error_is_not_a_pam_code() {
        let err = DmError::Protocol(ProtocolError::Truncated { needed: 8, have: 3 });
        assert_eq!(err.pam_code(), PAM_SYSTEM_ERR);
    }

    #[test]
    fn test_user_unknown_constructor() {
        let err = PamError::user_unknown("ghost");
        assert_eq!(err.code, PAM_USER_UNKNOWN);
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_pam_success_is_success() {
        assert!(PamError::new(PAM_SUCCESS, "ok").is_success());
        assert!(!PamError::system_err("boom").is_success());
    }
}
