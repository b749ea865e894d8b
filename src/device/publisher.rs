//! Outbound publishing: telemetry with lazy reconnect, and invoke replies

use super::connection::{ConnectionError, ConnectionManager};
use crate::protocol::topics::{build_invoke_reply_topic, build_telemetry_topic};
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a telemetry publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport; the broker's PUBACK is not awaited
    Sent,
    /// Link was down; a background connect cycle may have been started
    NotConnected,
}

/// Publishes on behalf of one device
pub struct Publisher<T: Transport> {
    connection: Arc<ConnectionManager<T>>,
    telemetry_topic: String,
}

impl<T: Transport> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            telemetry_topic: self.telemetry_topic.clone(),
        }
    }
}

impl<T: Transport> Publisher<T> {
    pub fn new(connection: Arc<ConnectionManager<T>>, device_id: &str) -> Self {
        Self {
            connection,
            telemetry_topic: build_telemetry_topic(device_id),
        }
    }

    pub fn telemetry_topic(&self) -> &str {
        &self.telemetry_topic
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection
    }

    /// Send telemetry on the device-to-cloud topic
    ///
    /// When the link is down this starts at most one background connect cycle
    /// and returns [`PublishOutcome::NotConnected`] without waiting for it.
    pub async fn publish(&self, payload: Vec<u8>) -> Result<PublishOutcome, ConnectionError> {
        if !self.connection.is_connected() {
            if self.connection.trigger_connect() {
                info!("Not connected, reconnecting in the background");
            } else {
                debug!("Not connected, telemetry not sent");
            }
            return Ok(PublishOutcome::NotConnected);
        }

        self.publish_to_topic(&self.telemetry_topic, payload).await?;
        Ok(PublishOutcome::Sent)
    }

    /// Serialize `value` as JSON and send it as telemetry
    pub async fn publish_json<S: Serialize>(
        &self,
        value: &S,
    ) -> Result<PublishOutcome, ConnectionError> {
        let payload = serde_json::to_vec(value).map_err(ConnectionError::Serialization)?;
        self.publish(payload).await
    }

    /// Publish on an explicit topic without checking connectivity
    pub async fn publish_to_topic(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        self.connection
            .transport()
            .publish(topic, payload)
            .await
            .map_err(|e| ConnectionError::PublishFailed(Box::new(e)))?;

        debug!("Published to {}", topic);
        Ok(())
    }

    /// Publish a reply for the invocation carrying `request_id`
    pub async fn invoke_reply(
        &self,
        status_code: u16,
        request_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        let topic = build_invoke_reply_topic(status_code, request_id)?;
        self.publish_to_topic(&topic, payload).await
    }
}
