//! Topic construction and parsing for the IoT hub MQTT dialect
//!
//! The broker only understands a fixed set of topic shapes, so every string
//! produced here must match the templates byte for byte:
//!
//! - Telemetry: `devices/{deviceId}/messages/events/`
//! - Cloud-to-device: `devices/{deviceId}/messages/devicebound/`
//! - Invoke request: `$iothub/methods/POST/{method}/?$rid={rid}`
//! - Invoke reply: `$iothub/methods/res/{status_code}/?$rid={rid}`

use std::fmt;
use thiserror::Error;

const DEVICES_PREFIX: &str = "devices/";
const TELEMETRY_SUFFIX: &str = "/messages/events/";
const CLOUD_TO_DEVICE_SUFFIX: &str = "/messages/devicebound/";

/// Prefix shared by every direct-method invocation topic
pub const INVOKE_BASE_TOPIC: &str = "$iothub/methods/POST/";
/// Wildcard subscription receiving every direct-method invocation
pub const INVOKE_SUBSCRIBE_TOPIC: &str = "$iothub/methods/POST/#";
/// Prefix shared by every direct-method reply topic
pub const INVOKE_REPLY_BASE_TOPIC: &str = "$iothub/methods/res/";

const INVOKE_REPLY_TEMPLATE: &str = "$iothub/methods/res/{status_code}/?$rid={rid}";
const STATUS_PLACEHOLDER: &str = "{status_code}";
const RID_PLACEHOLDER: &str = "{rid}";
const RID_MARKER: &str = "?$rid=";

/// Topic codec errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TopicError {
    #[error("Unrecognized topic: {0}")]
    UnrecognizedTopic(String),
    #[error("Missing request id in topic: {0}")]
    MissingRequestId(String),
    #[error("Malformed topic template: {0}")]
    MalformedTemplate(String),
}

/// Method name and correlation id carried by an invoke-request topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeRequest {
    pub method: String,
    pub request_id: String,
}

/// Structured form of every topic the device publishes or subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Telemetry { device_id: String },
    CloudToDevice { device_id: String },
    InvokeRequest { method: String, request_id: String },
    InvokeReply { status_code: u16, request_id: String },
}

impl Topic {
    /// Classify a raw topic string into one of the known topic families
    pub fn parse(topic: &str) -> Result<Topic, TopicError> {
        if topic.starts_with(INVOKE_BASE_TOPIC) {
            let request = parse_invoke_request_topic(topic)?;
            return Ok(Topic::InvokeRequest {
                method: request.method,
                request_id: request.request_id,
            });
        }

        if let Some(rest) = topic.strip_prefix(INVOKE_REPLY_BASE_TOPIC) {
            let (status, request_id) = rest
                .split_once(RID_MARKER)
                .ok_or_else(|| TopicError::MissingRequestId(topic.to_string()))?;
            let status_code = status
                .trim_end_matches('/')
                .parse::<u16>()
                .map_err(|_| TopicError::UnrecognizedTopic(topic.to_string()))?;
            if request_id.is_empty() {
                return Err(TopicError::MissingRequestId(topic.to_string()));
            }
            return Ok(Topic::InvokeReply {
                status_code,
                request_id: request_id.to_string(),
            });
        }

        if let Some(rest) = topic.strip_prefix(DEVICES_PREFIX) {
            if let Some((device_id, _)) = rest.split_once('/') {
                let tail = &rest[device_id.len()..];
                if !device_id.is_empty() && tail == TELEMETRY_SUFFIX {
                    return Ok(Topic::Telemetry {
                        device_id: device_id.to_string(),
                    });
                }
                // Cloud-to-device topics carry message properties after the fixed part
                if !device_id.is_empty() && tail.starts_with(CLOUD_TO_DEVICE_SUFFIX) {
                    return Ok(Topic::CloudToDevice {
                        device_id: device_id.to_string(),
                    });
                }
            }
        }

        Err(TopicError::UnrecognizedTopic(topic.to_string()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Telemetry { device_id } => f.write_str(&build_telemetry_topic(device_id)),
            Topic::CloudToDevice { device_id } => {
                f.write_str(&build_cloud_to_device_topic(device_id))
            }
            Topic::InvokeRequest { method, request_id } => {
                f.write_str(&build_invoke_request_topic(method, request_id))
            }
            Topic::InvokeReply {
                status_code,
                request_id,
            } => {
                let topic = build_invoke_reply_topic(*status_code, request_id)
                    .map_err(|_| fmt::Error)?;
                f.write_str(&topic)
            }
        }
    }
}

/// Build device-to-cloud telemetry topic: `devices/{device_id}/messages/events/`
pub fn build_telemetry_topic(device_id: &str) -> String {
    format!("{DEVICES_PREFIX}{device_id}{TELEMETRY_SUFFIX}")
}

/// Build cloud-to-device topic: `devices/{device_id}/messages/devicebound/`
pub fn build_cloud_to_device_topic(device_id: &str) -> String {
    format!("{DEVICES_PREFIX}{device_id}{CLOUD_TO_DEVICE_SUFFIX}")
}

/// Build the cloud-to-device wildcard subscription
pub fn build_cloud_to_device_subscription(device_id: &str) -> String {
    format!("{}#", build_cloud_to_device_topic(device_id))
}

/// Build invoke request topic: `$iothub/methods/POST/{method}/?$rid={rid}`
pub fn build_invoke_request_topic(method: &str, request_id: &str) -> String {
    format!("{INVOKE_BASE_TOPIC}{method}/{RID_MARKER}{request_id}")
}

/// Build invoke reply topic: `$iothub/methods/res/{status_code}/?$rid={rid}`
pub fn build_invoke_reply_topic(status_code: u16, request_id: &str) -> Result<String, TopicError> {
    fill_reply_template(INVOKE_REPLY_TEMPLATE, status_code, request_id)
}

fn fill_reply_template(
    template: &str,
    status_code: u16,
    request_id: &str,
) -> Result<String, TopicError> {
    if !template.contains(STATUS_PLACEHOLDER) || !template.contains(RID_PLACEHOLDER) {
        return Err(TopicError::MalformedTemplate(template.to_string()));
    }

    Ok(template
        .replacen(STATUS_PLACEHOLDER, &status_code.to_string(), 1)
        .replacen(RID_PLACEHOLDER, request_id, 1))
}

/// Extract method name and request id from an invoke-request topic
pub fn parse_invoke_request_topic(topic: &str) -> Result<InvokeRequest, TopicError> {
    let rest = topic
        .strip_prefix(INVOKE_BASE_TOPIC)
        .ok_or_else(|| TopicError::UnrecognizedTopic(topic.to_string()))?;

    let method = rest.split('/').next().unwrap_or_default();
    if method.is_empty() || method.starts_with(RID_MARKER) {
        return Err(TopicError::UnrecognizedTopic(topic.to_string()));
    }

    let request_id = match rest.split_once(RID_MARKER) {
        Some((_, rid)) if !rid.is_empty() => rid,
        _ => return Err(TopicError::MissingRequestId(topic.to_string())),
    };

    Ok(InvokeRequest {
        method: method.to_string(),
        request_id: request_id.to_string(),
    })
}
