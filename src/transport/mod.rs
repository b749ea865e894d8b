//! Transport layer for broker communication
//!
//! The MQTT client library is an external collaborator: it owns the wire
//! protocol, TLS and its own network loop. This module defines the two seams
//! the rest of the crate talks to it through, plus the rumqttc implementation.

use std::sync::Arc;

pub mod mqtt;

/// Outbound capability of a broker transport
///
/// One `open` call is one connection attempt. A successful attempt must invoke
/// [`TransportEvents::on_connected`] before returning, and from then on deliver
/// inbound messages and the eventual disconnect through the same `events`
/// handle from the transport's own task.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempt to open the connection once
    async fn open(&self, events: Arc<dyn TransportEvents>) -> Result<(), Self::Error>;

    /// Close the connection and stop the transport's network loop
    async fn close(&self) -> Result<(), Self::Error>;

    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error>;

    /// Subscribe to a topic filter; must not block waiting on the network loop
    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error>;
}

/// Callbacks a transport invokes from its network loop
#[async_trait::async_trait]
pub trait TransportEvents: Send + Sync {
    /// The broker acknowledged the connection
    async fn on_connected(&self);

    /// The connection was lost or closed
    async fn on_disconnected(&self, reason: &str);

    /// A message arrived on a subscribed topic
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Message received from the broker, queued for the command dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Type alias for the rumqttc-backed transport
pub type MqttTransport = mqtt::MqttClient;
