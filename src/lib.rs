//! IoT hub device client
//!
//! Connects one device identity to an IoT-hub style MQTT broker, publishes
//! telemetry, and serves direct-method invocations with correlated replies.
//!
//! # Overview
//!
//! - [`protocol`] - Topic codec and JSON payload types
//! - [`transport`] - Broker transport seam and its rumqttc implementation
//! - [`device`] - Connection lifecycle, publishing, command dispatch, telemetry
//! - [`config`] - TOML configuration
//!
//! # Quick Start
//!
//! ```rust
//! use iothub_device::protocol::{build_invoke_reply_topic, parse_invoke_request_topic};
//!
//! let request = parse_invoke_request_topic("$iothub/methods/POST/ping/?$rid=42").unwrap();
//! assert_eq!(request.method, "ping");
//!
//! let reply = build_invoke_reply_topic(200, &request.request_id).unwrap();
//! assert_eq!(reply, "$iothub/methods/res/200/?$rid=42");
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, DeviceConfig, DeviceIdentity};
pub use device::{
    builtin_registry, CommandDispatcher, CommandHandler, CommandRegistry, ConnectionError,
    ConnectionManager, ConnectionState, DeviceRuntime, PublishOutcome, Publisher,
};
pub use error::{CommandError, CommandResult};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
