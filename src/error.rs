//! Command error types and their mapping onto direct-method replies
//!
//! Every failure that happens while serving a direct-method invocation ends up
//! as a reply on the invoke-reply topic, never as a process error. This module
//! owns that mapping: status code selection and a sanitized `{"message": ...}`
//! body.

use crate::protocol::messages::{
    ErrorReply, PayloadDecodeError, STATUS_INTERNAL_ERROR, STATUS_NOT_FOUND,
};
use std::sync::OnceLock;
use thiserror::Error;

const MAX_MESSAGE_LEN: usize = 500;

/// Failure while serving a direct-method invocation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    #[error("Command failed: {message}")]
    HandlerFailed { message: String },

    #[error("Command '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Command '{method}' panicked")]
    Panicked { method: String },

    #[error("Unknown command: {method}")]
    UnknownCommand { method: String },
}

impl CommandError {
    /// Status code used on the reply topic for this error
    pub fn status_code(&self) -> u16 {
        match self {
            CommandError::UnknownCommand { .. } => STATUS_NOT_FOUND,
            _ => STATUS_INTERNAL_ERROR,
        }
    }

    /// Convert into the reply body published back to the cloud
    pub fn to_reply(&self) -> ErrorReply {
        ErrorReply::new(sanitize_error_message(&self.to_string()))
    }

    /// Create invalid payload error
    pub fn invalid_payload<S: Into<String>>(message: S) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Create handler failure error
    pub fn handler_failed<S: Into<String>>(message: S) -> Self {
        Self::HandlerFailed {
            message: message.into(),
        }
    }
}

impl From<PayloadDecodeError> for CommandError {
    fn from(err: PayloadDecodeError) -> Self {
        Self::invalid_payload(err.to_string())
    }
}

fn secret_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"(?i)(password|token|key|secret|sharedaccesssignature)[=:]\s*[^\s;&]+")
            .expect("secret pattern is a valid regex")
    })
}

fn path_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|certs?|\.ssh|private)/[a-zA-Z0-9._/-]+")
            .expect("path pattern is a valid regex")
    })
}

/// Redact credentials and key material paths, then cap the length
fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = secret_pattern()
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = path_pattern()
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for command handlers
pub type CommandResult<T> = Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(CommandError::handler_failed("boom").status_code(), 500);
        assert_eq!(CommandError::invalid_payload("bad").status_code(), 500);
        assert_eq!(
            CommandError::Timeout {
                method: "slow".to_string(),
                timeout_ms: 10
            }
            .status_code(),
            500
        );
        assert_eq!(
            CommandError::UnknownCommand {
                method: "reboot".to_string()
            }
            .status_code(),
            404
        );
    }

    #[test]
    fn test_decode_error_becomes_invalid_payload() {
        let decode_err = crate::protocol::messages::decode_json_payload(b"{oops").unwrap_err();
        let error = CommandError::from(decode_err);

        assert!(matches!(error, CommandError::InvalidPayload { .. }));
        assert_eq!(error.status_code(), 500);
        assert!(error.to_reply().message.starts_with("Invalid payload: Payload is not valid JSON"));
    }

    #[test]
    fn test_reply_carries_error_text() {
        let reply = CommandError::handler_failed("sensor offline").to_reply();
        assert_eq!(reply.message, "Command failed: sensor offline");
    }

    #[test]
    fn test_reply_redacts_secrets() {
        let error = CommandError::handler_failed(
            "auth failed: password=hunter2 SharedAccessSignature=sr%3Dabc",
        );
        let reply = error.to_reply();

        assert!(!reply.message.contains("hunter2"));
        assert!(!reply.message.contains("sr%3Dabc"));
        assert!(reply.message.contains("password=***"));
    }

    #[test]
    fn test_reply_redacts_key_paths() {
        let sanitized = sanitize_error_message("cannot open /etc/device/certs/device.key");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("device.key"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_short_message_untouched() {
        assert_eq!(sanitize_error_message("plain failure"), "plain failure");
        assert_eq!(sanitize_error_message(""), "");
    }
}
