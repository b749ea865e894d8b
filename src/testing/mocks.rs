//! Mock implementations for testing
//!
//! Provides a scriptable [`Transport`] so the connection manager, publisher and
//! dispatcher can be exercised without a broker.

use crate::transport::{Transport, TransportEvents};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MockTransportError {
    #[error("Mock connection refused (attempt {0})")]
    ConnectionRefused(u32),
    #[error("Mock publish failure")]
    PublishFailed,
    #[error("Mock transport not connected")]
    NotConnected,
}

/// Mock transport for testing
///
/// `open` fails for the first `failures_before_success` calls and succeeds
/// afterwards; `u32::MAX` makes every call fail.
#[derive(Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub failures_before_success: u32,
    pub publish_should_fail: bool,
    pub open_delay: Option<Duration>,
    open_calls: AtomicU32,
    close_calls: AtomicU32,
    events: Mutex<Option<Arc<dyn TransportEvents>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection attempt is refused
    pub fn failing_always() -> Self {
        Self::failing_times(u32::MAX)
    }

    /// The first `failures` connection attempts are refused
    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures_before_success: failures,
            ..Default::default()
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn with_publish_failure(mut self) -> Self {
        self.publish_should_fail = true;
        self
    }

    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    pub async fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
        self.subscriptions.lock().await.clear();
    }

    /// Pretend the broker dropped the connection
    pub async fn simulate_disconnect(&self, reason: &str) {
        let events = self.events.lock().await.take();
        if let Some(events) = events {
            events.on_disconnected(reason).await;
        }
    }

    /// Pretend a message arrived on a subscribed topic
    pub async fn simulate_message(&self, topic: &str, payload: &[u8]) {
        let events = self.events.lock().await.clone();
        if let Some(events) = events {
            events.on_message(topic, payload).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn open(&self, events: Arc<dyn TransportEvents>) -> Result<(), Self::Error> {
        let attempt = self.open_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }

        if attempt <= self.failures_before_success {
            return Err(MockTransportError::ConnectionRefused(attempt));
        }

        *self.events.lock().await = Some(events.clone());
        events.on_connected().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_disconnect("Closed by client").await;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Self::Error> {
        if self.publish_should_fail {
            return Err(MockTransportError::PublishFailed);
        }

        self.published_messages
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        if self.events.lock().await.is_none() {
            return Err(MockTransportError::NotConnected);
        }

        self.subscriptions.lock().await.push(topic.to_string());
        Ok(())
    }
}
