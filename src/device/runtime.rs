//! Wiring of one device: connection, publisher, dispatcher and telemetry

use super::connection::{ConnectionError, ConnectionManager};
use super::dispatcher::{CommandDispatcher, CommandRegistry};
use super::publisher::Publisher;
use super::reconnect::ReconnectConfig;
use super::telemetry::{run_telemetry_loop, HeartbeatSource};
use crate::config::DeviceConfig;
use crate::lifecycle_span;
use crate::protocol::topics::{build_cloud_to_device_subscription, INVOKE_SUBSCRIBE_TOPIC};
use crate::transport::{InboundMessage, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

const INBOUND_QUEUE_CAPACITY: usize = 64;
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running device session
pub struct DeviceRuntime<T: Transport> {
    device_id: String,
    connection: Arc<ConnectionManager<T>>,
    publisher: Publisher<T>,
    dispatcher: Arc<CommandDispatcher<T>>,
    telemetry: Option<(String, Duration)>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> DeviceRuntime<T> {
    pub fn new(config: &DeviceConfig, transport: Arc<T>, registry: CommandRegistry) -> Self {
        let device_id = config.device.id.clone();

        let mut subscriptions = vec![INVOKE_SUBSCRIBE_TOPIC.to_string()];
        if config.broker.subscribe_cloud_to_device {
            subscriptions.push(build_cloud_to_device_subscription(&device_id));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let connection = Arc::new(
            ConnectionManager::new(transport, ReconnectConfig::from(&config.reconnect))
                .with_subscriptions(subscriptions)
                .with_message_sender(inbound_tx),
        );

        let publisher = Publisher::new(connection.clone(), &device_id);
        let dispatcher = Arc::new(
            CommandDispatcher::new(Arc::new(registry), publisher.clone())
                .with_handler_timeout(config.command_timeout())
                .with_unknown_command_policy(config.commands.unknown_command)
                .with_max_concurrent_commands(config.commands.max_concurrent),
        );

        let telemetry = config
            .telemetry
            .enabled
            .then(|| (config.telemetry.schema.clone(), config.telemetry_interval()));

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            device_id,
            connection,
            publisher,
            dispatcher,
            telemetry,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection
    }

    pub fn publisher(&self) -> &Publisher<T> {
        &self.publisher
    }

    /// Spawn the dispatcher and telemetry tasks, then make the first connection
    ///
    /// A failed first connection is returned but leaves the runtime running:
    /// telemetry ticks keep triggering background reconnects.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        let span = lifecycle_span!(event = "start", device_id = %self.device_id);
        async {
            let mut tasks = self.tasks.lock().await;

            if let Some(inbound_rx) = self.inbound_rx.lock().await.take() {
                tasks.push(tokio::spawn(
                    self.dispatcher
                        .clone()
                        .run(inbound_rx, self.shutdown_tx.subscribe()),
                ));
            } else {
                warn!("Runtime already started");
                return Ok(());
            }

            if let Some((schema, interval)) = &self.telemetry {
                tasks.push(tokio::spawn(run_telemetry_loop(
                    self.publisher.clone(),
                    HeartbeatSource::new(),
                    schema.clone(),
                    *interval,
                    self.shutdown_tx.subscribe(),
                )));
            }
            drop(tasks);

            info!("Device runtime started");
            match self.connection.connect().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("Initial connection failed: {}", e);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Stop background tasks and close the connection
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        info!("Shutting down device runtime");
        self.shutdown_tx.send_replace(true);

        let result = self.connection.stop().await;

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_GRACE, &mut task)
                .await
                .is_err()
            {
                warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }

        info!("Device runtime stopped");
        result
    }
}
