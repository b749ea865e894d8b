//! rumqttc implementation of the broker transport
//!
//! Split the same way as the rest of the transport code: pure configuration
//! and routing decisions live apart from the I/O that uses them.
//!
//! - [`connection`] - Pure option/TLS configuration and transport errors
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`client`] - Network loop ownership and the [`Transport`](crate::transport::Transport) impl
//!
//! # Usage
//!
//! ```rust,no_run
//! use iothub_device::config::DeviceConfig;
//! use iothub_device::transport::mqtt::MqttClient;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeviceConfig::load_from_file(std::path::Path::new("device.toml"))?;
//! let transport = MqttClient::new(&config.identity(), &config.broker, config.get_sas_token()?)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

// Re-export public types for convenience
pub use client::MqttClient;
pub use connection::{configure_mqtt_options, configure_transport, MqttError};
pub use message_handler::{EventRoute, MessageHandler};
