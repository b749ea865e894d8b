//! Impure I/O operations for the MQTT transport
//!
//! Owns the rumqttc client and its network loop. Every `open` builds a fresh
//! client/event-loop pair, drives it until the broker's ConnAck, then hands
//! the loop to a background task that reports messages and the eventual
//! disconnect through [`TransportEvents`].

use super::connection::{configure_mqtt_options, MqttError};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{BrokerSection, DeviceIdentity};
use crate::transport::{Transport, TransportEvents};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// rumqttc-backed transport for one device identity
pub struct MqttClient {
    device_id: String,
    options: MqttOptions,
    connack_timeout: Duration,
    client: Mutex<Option<AsyncClient>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    pub fn new(
        identity: &DeviceIdentity,
        broker: &BrokerSection,
        sas_token: Option<String>,
    ) -> Result<Self, MqttError> {
        let options = configure_mqtt_options(identity, broker, sas_token)?;
        Ok(Self::from_options(
            &identity.device_id,
            options,
            Duration::from_secs(broker.connack_timeout_secs),
        ))
    }

    /// Build a transport from ready-made options
    pub fn from_options(device_id: &str, options: MqttOptions, connack_timeout: Duration) -> Self {
        Self {
            device_id: device_id.to_string(),
            options,
            connack_timeout,
            client: Mutex::new(None),
            event_loop_handle: Mutex::new(None),
        }
    }

    /// Poll a fresh event loop until the broker accepts or refuses the connection
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), MqttError> {
        loop {
            let event = event_loop
                .poll()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok(()),
                EventRoute::ConnectionRefused(code) => {
                    return Err(MqttError::ConnectionRefused(code))
                }
                _ => continue,
            }
        }
    }

    /// Drive the network loop until the connection ends
    async fn run_event_loop(
        device_id: String,
        mut event_loop: EventLoop,
        events: Arc<dyn TransportEvents>,
    ) {
        info!("Starting MQTT event loop for device: {}", device_id);

        let reason = loop {
            match event_loop.poll().await {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::MessageReceived {
                        topic,
                        payload,
                        retain,
                    } => {
                        debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                        if MessageHandler::should_process_message(&topic, retain) {
                            events.on_message(&topic, &payload).await;
                        }
                    }
                    EventRoute::Disconnected => break "Broker disconnected".to_string(),
                    EventRoute::ConnectionRefused(code) => {
                        break format!("Broker refused connection: {code}")
                    }
                    EventRoute::SubscriptionConfirmed {
                        packet_id,
                        rejected,
                    } => {
                        if rejected {
                            warn!("Broker rejected subscription (packet {})", packet_id);
                        } else {
                            debug!(target: "mqtt_transport", "Subscription confirmed: {}", packet_id);
                        }
                    }
                    EventRoute::InfrastructureEvent(event_str) => {
                        debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                    }
                    EventRoute::ConnectionAcknowledged | EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    error!("MQTT event loop error for device {}: {}", device_id, e);
                    break e.to_string();
                }
            }
        };

        // Stop polling: rumqttc would otherwise reconnect on its own, and
        // retries belong to the connection manager
        events.on_disconnected(&reason).await;
        info!("MQTT event loop stopped for device: {}", device_id);
    }

    async fn stop_event_loop(&self) {
        let handle = self.event_loop_handle.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn open(&self, events: Arc<dyn TransportEvents>) -> Result<(), MqttError> {
        // A previous loop only survives here if the caller skipped close()
        if let Some(stale) = self.event_loop_handle.lock().await.take() {
            stale.abort();
        }

        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), REQUEST_CHANNEL_CAPACITY);

        match tokio::time::timeout(self.connack_timeout, Self::wait_for_connack(&mut event_loop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(MqttError::ConnAckTimeout(self.connack_timeout)),
        }

        *self.client.lock().await = Some(client);

        // Subscriptions issued from the callback queue up until the loop task polls them
        events.on_connected().await;

        let span = crate::mqtt_span!(device_id = %self.device_id);
        let handle = tokio::spawn(
            Self::run_event_loop(self.device_id.clone(), event_loop, events).instrument(span),
        );
        *self.event_loop_handle.lock().await = Some(handle);

        Ok(())
    }

    async fn close(&self) -> Result<(), MqttError> {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!(target: "mqtt_transport", "Disconnect request not delivered: {}", e);
            }
        }

        self.stop_event_loop().await;
        info!("MQTT client disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        let client = self.client.lock().await;
        let client = client.as_ref().ok_or(MqttError::NotConnected)?;

        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", "Published to {}", topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        let client = self.client.lock().await;
        let client = client.as_ref().ok_or(MqttError::NotConnected)?;

        // try_subscribe: called from inside the network loop's callback path
        client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", "Subscribed to: {}", topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_client() -> MqttClient {
        // Port 9 (discard) on localhost refuses connections quickly
        let options = MqttOptions::new("test-device", "127.0.0.1", 9);
        MqttClient::from_options("test-device", options, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_publish_before_open_fails() {
        let client = unreachable_client();
        let result = client.publish("devices/test-device/messages/events/", b"{}".to_vec()).await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_subscribe_before_open_fails() {
        let client = unreachable_client();
        let result = client.subscribe("$iothub/methods/POST/#").await;
        assert!(matches!(result, Err(MqttError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_without_open_is_ok() {
        let client = unreachable_client();
        assert!(client.close().await.is_ok());
    }
}
