//! Periodic device-to-cloud telemetry

use super::publisher::{PublishOutcome, Publisher};
use crate::protocol::messages::TelemetryMessage;
use crate::transport::Transport;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Produces the `payload` part of each telemetry message
pub trait TelemetrySource: Send + 'static {
    fn sample(&mut self) -> Value;
}

/// Default source: a sequence number and process uptime
pub struct HeartbeatSource {
    sequence: u64,
    started: Instant,
}

impl HeartbeatSource {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            started: Instant::now(),
        }
    }
}

impl Default for HeartbeatSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for HeartbeatSource {
    fn sample(&mut self) -> Value {
        self.sequence += 1;
        json!({
            "sequence": self.sequence,
            "uptime_secs": self.started.elapsed().as_secs(),
        })
    }
}

/// Publish one sample every `interval` until shutdown
///
/// The first sample goes out one interval after start. A tick that finds the
/// link down only starts a background reconnect; the next tick tries again.
pub async fn run_telemetry_loop<T: Transport, S: TelemetrySource>(
    publisher: Publisher<T>,
    mut source: S,
    schema: String,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Telemetry loop started, interval {:?}", interval);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,
            _ = ticker.tick() => {
                let message = TelemetryMessage::new(schema.as_str(), source.sample());
                match publisher.publish_json(&message).await {
                    Ok(PublishOutcome::Sent) => debug!("Telemetry sent"),
                    Ok(PublishOutcome::NotConnected) => {
                        warn!("Telemetry skipped: not connected")
                    }
                    Err(e) => warn!("Telemetry publish failed: {}", e),
                }
            }
        }
    }

    info!("Telemetry loop stopped");
}
