//! Connection lifecycle for a single broker link
//!
//! The [`ConnectionManager`] runs bounded connect cycles against a
//! [`Transport`], owns the connectivity flag, and implements
//! [`TransportEvents`] so the transport can report connect, disconnect and
//! inbound messages from its own task.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected   (broker/network)
//!                 Connecting -> Disconnected                (retries exhausted, stop)
//! ```

use super::reconnect::{ReconnectConfig, ReconnectPolicy, RetryDecision};
use crate::protocol::TopicError;
use crate::transport::{InboundMessage, Transport, TransportEvents};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Connectivity of the broker link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A connect cycle is running
    Connecting,
    /// The broker acknowledged the connection
    Connected,
}

/// Connection and publishing errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection attempts exhausted after {attempts} tries: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("A connect cycle is already running")]
    AlreadyConnecting,
    #[error("Connection cancelled")]
    Cancelled,
    #[error("Closing the transport failed")]
    CloseFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
    #[error(transparent)]
    Topic(#[from] TopicError),
}

/// Releases the single-cycle flag even if the connect future is dropped
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of the broker connection lifecycle
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    reconnect_config: ReconnectConfig,
    subscriptions: Vec<String>,
    message_sender: Option<mpsc::Sender<InboundMessage>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    connecting: AtomicBool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, reconnect_config: ReconnectConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            transport,
            reconnect_config,
            subscriptions: Vec::new(),
            message_sender: None,
            state_tx,
            shutdown_tx,
            connecting: AtomicBool::new(false),
        }
    }

    /// Topic filters (re)subscribed on every successful connect
    pub fn with_subscriptions(mut self, subscriptions: Vec<String>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Channel inbound messages are forwarded to
    pub fn with_message_sender(mut self, sender: mpsc::Sender<InboundMessage>) -> Self {
        self.message_sender = Some(sender);
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Non-blocking read of the connectivity flag
    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!("MQTT connection state: {:?} -> {:?}", previous, next);
        }
    }

    /// Run one connect cycle: up to `max_retries + 1` attempts with backoff
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if self.is_stopped() {
            return Err(ConnectionError::Cancelled);
        }
        if self.is_connected() {
            return Ok(());
        }

        let _cycle =
            CycleGuard::acquire(&self.connecting).ok_or(ConnectionError::AlreadyConnecting)?;
        self.transition(ConnectionState::Connecting);

        let max_attempts = self.reconnect_config.max_attempts();
        let mut attempt = 1u32;

        loop {
            debug!("MQTT connect attempt {}/{}", attempt, max_attempts);

            let events: Arc<dyn TransportEvents> = self.clone();
            let last_error = match self.transport.open(events).await {
                Ok(()) if self.is_stopped() => {
                    // stop() ran while this attempt was in flight
                    info!("Shutdown requested during connect, closing new connection");
                    if let Err(e) = self.transport.close().await {
                        warn!("Failed to close connection opened after stop: {}", e);
                    }
                    self.transition(ConnectionState::Disconnected);
                    return Err(ConnectionError::Cancelled);
                }
                Ok(()) => {
                    info!("MQTT connected after {} attempt(s)", attempt);
                    return Ok(());
                }
                Err(e) => e.to_string(),
            };
            error!("MQTT connect error: {}", last_error);

            match ReconnectPolicy::after_failure(
                attempt,
                &self.reconnect_config,
                self.is_stopped(),
            ) {
                RetryDecision::Retry {
                    attempt: next,
                    delay_ms,
                } => {
                    info!(
                        "Retrying MQTT connection {}/{} after {}ms delay",
                        next, max_attempts, delay_ms
                    );
                    if !self.interruptible_sleep(delay_ms).await {
                        self.transition(ConnectionState::Disconnected);
                        return Err(ConnectionError::Cancelled);
                    }
                    attempt = next;
                }
                RetryDecision::AbortShutdownRequested => {
                    info!("Shutdown requested, abandoning connect cycle");
                    self.transition(ConnectionState::Disconnected);
                    return Err(ConnectionError::Cancelled);
                }
                RetryDecision::AbortExhausted => {
                    warn!("MQTT connection failed after {} attempts", attempt);
                    self.transition(ConnectionState::Disconnected);
                    return Err(ConnectionError::Exhausted {
                        attempts: attempt,
                        last_error,
                    });
                }
            }
        }
    }

    /// Start a connect cycle in the background unless one is already running
    ///
    /// Returns whether a new cycle was spawned. The caller does not wait for it.
    pub fn trigger_connect(self: &Arc<Self>) -> bool {
        if self.is_stopped() || self.is_connected() || self.connecting.load(Ordering::Acquire) {
            return false;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            match manager.connect().await {
                Ok(()) => {}
                Err(ConnectionError::AlreadyConnecting) => {
                    debug!("Background connect skipped: cycle already running");
                }
                Err(e) => warn!("Background connect failed: {}", e),
            }
        });
        true
    }

    /// Sleep unless shutdown is requested first; returns false on shutdown
    async fn interruptible_sleep(&self, delay_ms: u64) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {
                info!("Shutdown signal received during reconnection delay, stopping");
                false
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Cancel any running connect cycle and close the transport
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        self.shutdown_tx.send_replace(true);
        info!("Stopping MQTT connection");

        let result = self
            .transport
            .close()
            .await
            .map_err(|e| ConnectionError::CloseFailed(Box::new(e)));

        self.transition(ConnectionState::Disconnected);
        result
    }
}

#[async_trait]
impl<T: Transport> TransportEvents for ConnectionManager<T> {
    async fn on_connected(&self) {
        if self.is_stopped() {
            debug!("Connection acknowledged after stop, not subscribing");
            return;
        }
        self.transition(ConnectionState::Connected);
        info!("MQTT connected, subscribing to {} topic(s)", self.subscriptions.len());

        for topic in &self.subscriptions {
            if let Err(e) = self.transport.subscribe(topic).await {
                error!("Failed to subscribe to {}: {}", topic, e);
            } else {
                debug!("Subscribed to {}", topic);
            }
        }
    }

    async fn on_disconnected(&self, reason: &str) {
        if self.state() == ConnectionState::Connected {
            warn!("MQTT connection lost: {}", reason);
        }
        // A dying connection must not clobber a cycle that is already reconnecting
        if self.state() != ConnectionState::Connecting {
            self.transition(ConnectionState::Disconnected);
        }
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        debug!("MQTT message arrived on {} ({} bytes)", topic, payload.len());

        let Some(sender) = &self.message_sender else {
            warn!("Received MQTT message but no dispatcher configured - message dropped");
            return;
        };

        let message = InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        match sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!("Dispatcher queue full, dropping message on {}", message.topic);
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                warn!("Dispatcher stopped, dropping message on {}", message.topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn fast_retries() -> ReconnectConfig {
        ReconnectConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_connect_success_sets_connected() {
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(ConnectionManager::new(transport.clone(), fast_retries()));

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.connect().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(transport.open_calls(), 1);
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(ConnectionManager::new(transport.clone(), fast_retries()));

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(transport.open_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let transport = Arc::new(MockTransport::failing_times(2));
        let manager = Arc::new(ConnectionManager::new(transport.clone(), fast_retries()));

        manager.connect().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(transport.open_calls(), 3);
    }

    #[tokio::test]
    async fn test_subscriptions_issued_on_connect() {
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(
            ConnectionManager::new(transport.clone(), fast_retries())
                .with_subscriptions(vec!["$iothub/methods/POST/#".to_string()]),
        );

        manager.connect().await.unwrap();
        assert_eq!(
            transport.get_subscriptions().await,
            vec!["$iothub/methods/POST/#".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stopped_manager_refuses_connect() {
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(ConnectionManager::new(transport.clone(), fast_retries()));

        manager.stop().await.unwrap();
        assert!(matches!(
            manager.connect().await,
            Err(ConnectionError::Cancelled)
        ));
        assert_eq!(transport.open_calls(), 0);
        assert!(!manager.trigger_connect());
    }

    #[tokio::test]
    async fn test_on_message_without_dispatcher_is_dropped() {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport, fast_retries());
        // Must not panic or block
        manager.on_message("$iothub/methods/POST/ping/?$rid=1", b"{}").await;
    }

    #[tokio::test]
    async fn test_on_message_forwards_to_channel() {
        let transport = Arc::new(MockTransport::new());
        let (tx, mut rx) = mpsc::channel(1);
        let manager = ConnectionManager::new(transport, fast_retries()).with_message_sender(tx);

        manager.on_message("topic/a", b"one").await;
        // Queue is full now; the second message is dropped without blocking
        manager.on_message("topic/b", b"two").await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, "topic/a");
        assert_eq!(received.payload, b"one");
        assert!(rx.try_recv().is_err());
    }
}
