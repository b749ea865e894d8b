//! Pure connection configuration for the MQTT transport
//!
//! Translates the device identity and broker section into rumqttc options:
//! client id, hub username, keep-alive, packet limits and TLS material.

use crate::config::{BrokerSection, DeviceIdentity};
use rumqttc::Transport as RumqttcTransport;
use rumqttc::{MqttOptions, TlsConfiguration};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// IoT hub caps MQTT messages at 256KB
const MAX_PACKET_SIZE: usize = 256 * 1024;
const DEFAULT_TLS_PORT: u16 = 8883;

/// rumqttc transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("No ConnAck received within {0:?}")]
    ConnAckTimeout(Duration),
    #[error("Broker refused connection: {0}")]
    ConnectionRefused(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected")]
    NotConnected,
    #[error("Failed to load TLS material from {path}: {source}")]
    Tls {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::Tls {
        path: path.display().to_string(),
        source,
    })
}

/// Pick the rumqttc transport for the broker section
///
/// A configured CA switches to rustls with that CA (plus the client certificate
/// when present); the standard TLS port without a CA uses the platform roots;
/// anything else is plain TCP, which only makes sense against a local broker.
pub fn configure_transport(broker: &BrokerSection) -> Result<RumqttcTransport, MqttError> {
    if let Some(ca_path) = &broker.ca_cert {
        let ca = read_pem(ca_path)?;
        let client_auth = match (&broker.device_cert, &broker.device_key) {
            (Some(cert_path), Some(key_path)) => Some((read_pem(cert_path)?, read_pem(key_path)?)),
            _ => None,
        };
        return Ok(RumqttcTransport::tls_with_config(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }

    if broker.port == DEFAULT_TLS_PORT {
        return Ok(RumqttcTransport::tls_with_default_config());
    }

    Ok(RumqttcTransport::tcp())
}

/// Pure function to configure MQTT options from the device identity
pub fn configure_mqtt_options(
    identity: &DeviceIdentity,
    broker: &BrokerSection,
    sas_token: Option<String>,
) -> Result<MqttOptions, MqttError> {
    // The hub requires the client id to equal the device id
    let mut mqtt_options = MqttOptions::new(
        &identity.device_id,
        &identity.broker_hostname,
        identity.broker_port,
    );

    mqtt_options.set_transport(configure_transport(broker)?);

    // Certificate auth still sends the username; the password is only used for SAS tokens
    mqtt_options.set_credentials(identity.username(), sas_token.unwrap_or_default());

    mqtt_options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    Ok(mqtt_options)
}
