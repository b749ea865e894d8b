//! JSON payload types exchanged with the broker
//!
//! Command payloads are free-form JSON objects; only the error reply and the
//! telemetry envelope have a fixed shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Status code of a successful direct-method reply
pub const STATUS_OK: u16 = 200;
/// Status code of a reply to a method nobody registered
pub const STATUS_NOT_FOUND: u16 = 404;
/// Status code of a failed direct-method reply
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Body of a non-200 direct-method reply
///
/// # Examples
/// ```
/// use iothub_device::protocol::ErrorReply;
///
/// let reply = ErrorReply::new("handler exploded");
/// assert_eq!(serde_json::to_string(&reply).unwrap(), r#"{"message":"handler exploded"}"#);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReply {
    pub message: String,
}

impl ErrorReply {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Device-to-cloud telemetry envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryMessage {
    /// Schema name the cloud side uses to interpret `payload`
    pub schema: String,
    /// Time the measurement was taken
    pub timestamp: DateTime<Utc>,
    /// Application-defined measurement fields
    pub payload: Value,
}

impl TelemetryMessage {
    pub fn new<S: Into<String>>(schema: S, payload: Value) -> Self {
        Self {
            schema: schema.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Why an inbound payload could not be turned into a JSON value
#[derive(Debug, Error)]
pub enum PayloadDecodeError {
    #[error("Payload is not UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Decode an MQTT payload as UTF-8 JSON
pub fn decode_json_payload(payload: &[u8]) -> Result<Value, PayloadDecodeError> {
    let text = std::str::from_utf8(payload)?;
    Ok(serde_json::from_str(text)?)
}
