//! Direct-method dispatch
//!
//! Inbound invoke requests are parsed, matched against a read-only
//! [`CommandRegistry`], executed on their own task under a timeout, and
//! answered on `$iothub/methods/res/{status}/?$rid={rid}`. Failures inside a
//! handler become 500 replies; nothing here propagates to the caller.

use super::publisher::Publisher;
use crate::command_span;
use crate::config::UnknownCommandPolicy;
use crate::error::{CommandError, CommandResult};
use crate::protocol::messages::{decode_json_payload, STATUS_OK};
use crate::protocol::topics::{Topic, INVOKE_BASE_TOPIC};
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

/// A named direct method the device can serve
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command with the decoded JSON payload; the returned value is
    /// the body of the 200 reply
    async fn handle(&self, payload: Value) -> CommandResult<Value>;
}

/// Adapter turning a synchronous closure into a [`CommandHandler`]
pub struct FnCommand<F>(pub F);

#[async_trait]
impl<F> CommandHandler for FnCommand<F>
where
    F: Fn(Value) -> CommandResult<Value> + Send + Sync,
{
    async fn handle(&self, payload: Value) -> CommandResult<Value> {
        (self.0)(payload)
    }
}

/// Command name to handler map, built once at startup
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration under the same name wins
    pub fn register<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: CommandHandler + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!("Command '{}' registered twice, keeping the last handler", name);
        }
        self
    }

    pub fn register_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> CommandResult<Value> + Send + Sync + 'static,
    {
        self.register(name, FnCommand(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not an invoke request
    Ignored,
    /// Invoke request dropped without a reply
    Dropped,
    /// A reply with this status was published (or attempted)
    Replied { status_code: u16 },
}

/// Routes invoke requests to registered handlers and publishes the replies
pub struct CommandDispatcher<T: Transport> {
    registry: Arc<CommandRegistry>,
    publisher: Publisher<T>,
    handler_timeout: Duration,
    unknown_command: UnknownCommandPolicy,
    in_flight: Arc<Semaphore>,
}

/// Invocations served at once unless configured otherwise
pub const DEFAULT_MAX_CONCURRENT_COMMANDS: usize = 16;

impl<T: Transport> CommandDispatcher<T> {
    pub fn new(registry: Arc<CommandRegistry>, publisher: Publisher<T>) -> Self {
        Self {
            registry,
            publisher,
            handler_timeout: Duration::from_secs(30),
            unknown_command: UnknownCommandPolicy::default(),
            in_flight: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_COMMANDS)),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_unknown_command_policy(mut self, policy: UnknownCommandPolicy) -> Self {
        self.unknown_command = policy;
        self
    }

    /// Cap the number of invocations [`run`](Self::run) serves at once
    ///
    /// Zero is treated as one.
    pub fn with_max_concurrent_commands(mut self, limit: usize) -> Self {
        self.in_flight = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Handle one inbound message end to end
    pub async fn handle_incoming(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let (method, request_id) = match Topic::parse(topic) {
            Ok(Topic::InvokeRequest { method, request_id }) => (method, request_id),
            Ok(Topic::CloudToDevice { device_id }) => {
                info!(
                    "Cloud-to-device message for {} ({} bytes): {}",
                    device_id,
                    payload.len(),
                    String::from_utf8_lossy(payload)
                );
                return DispatchOutcome::Ignored;
            }
            Ok(other) => {
                debug!("Ignoring message on non-invoke topic: {}", other);
                return DispatchOutcome::Ignored;
            }
            Err(e) if topic.starts_with(INVOKE_BASE_TOPIC) => {
                warn!("Dropping malformed invoke request: {}", e);
                return DispatchOutcome::Dropped;
            }
            Err(e) => {
                debug!("Ignoring message: {}", e);
                return DispatchOutcome::Ignored;
            }
        };

        let span = command_span!(method = %method, rid = %request_id);
        self.dispatch(&method, &request_id, payload)
            .instrument(span)
            .await
    }

    async fn dispatch(&self, method: &str, request_id: &str, payload: &[u8]) -> DispatchOutcome {
        info!("Direct method invoked");

        let args = match decode_json_payload(payload) {
            Ok(args) => args,
            Err(e) => {
                warn!("Rejecting invocation: {}", e);
                return self.reply_error(request_id, CommandError::from(e)).await;
            }
        };

        let Some(handler) = self.registry.get(method) else {
            let err = CommandError::UnknownCommand {
                method: method.to_string(),
            };
            return match self.unknown_command {
                UnknownCommandPolicy::ReplyNotFound => {
                    warn!("No handler registered");
                    self.reply_error(request_id, err).await
                }
                UnknownCommandPolicy::Drop => {
                    warn!("No handler registered, dropping invocation");
                    DispatchOutcome::Dropped
                }
            };
        };

        match self.run_handler(method, handler, args).await {
            Ok(body) => self.reply(STATUS_OK, request_id, &body).await,
            Err(e) => {
                error!("Direct method failed: {}", e);
                self.reply_error(request_id, e).await
            }
        }
    }

    /// Run a handler on its own task so a panic or hang stays contained
    async fn run_handler(
        &self,
        method: &str,
        handler: Arc<dyn CommandHandler>,
        args: Value,
    ) -> CommandResult<Value> {
        let mut task = tokio::spawn(async move { handler.handle(args).await }.in_current_span());

        match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!("Handler task failed: {}", join_error);
                Err(CommandError::Panicked {
                    method: method.to_string(),
                })
            }
            Err(_) => {
                task.abort();
                Err(CommandError::Timeout {
                    method: method.to_string(),
                    timeout_ms: u64::try_from(self.handler_timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    async fn reply_error(&self, request_id: &str, err: CommandError) -> DispatchOutcome {
        let body = match serde_json::to_value(err.to_reply()) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode error reply: {}", e);
                Value::Object(Default::default())
            }
        };
        self.reply(err.status_code(), request_id, &body).await
    }

    async fn reply(&self, status_code: u16, request_id: &str, body: &Value) -> DispatchOutcome {
        let payload = body.to_string().into_bytes();
        match self
            .publisher
            .invoke_reply(status_code, request_id, payload)
            .await
        {
            Ok(()) => debug!("Replied {} to rid {}", status_code, request_id),
            Err(e) => error!("Failed to publish reply for rid {}: {}", request_id, e),
        }
        DispatchOutcome::Replied { status_code }
    }

    /// Consume inbound messages until shutdown, one task per message
    ///
    /// A message is only taken off the queue once a concurrency slot is free,
    /// so a burst of invocations backs up into the bounded inbound channel
    /// instead of spawning without limit.
    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<InboundMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            "Command dispatcher started with {} command(s): {:?}",
            self.registry.len(),
            self.registry.names()
        );

        loop {
            let permit = tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,
                permit = self.in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,
                message = messages.recv() => message,
            };
            let Some(message) = message else {
                info!("Inbound channel closed, command dispatcher stopping");
                return;
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher
                    .handle_incoming(&message.topic, &message.payload)
                    .await;
                drop(permit);
            });
        }

        info!("Command dispatcher stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::connection::ConnectionManager;
    use crate::device::reconnect::ReconnectConfig;
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher_with(
        registry: CommandRegistry,
    ) -> (CommandDispatcher<MockTransport>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(ConnectionManager::new(
            transport.clone(),
            ReconnectConfig::default(),
        ));
        let publisher = Publisher::new(manager, "dev1");
        (
            CommandDispatcher::new(Arc::new(registry), publisher),
            transport,
        )
    }

    #[test]
    fn test_registry_lookup() {
        let registry = CommandRegistry::new()
            .register_fn("b", |_| Ok(json!({})))
            .register_fn("a", |_| Ok(json!({})));

        assert!(registry.contains("a"));
        assert!(!registry.contains("c"));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_success_reply() {
        let registry = CommandRegistry::new().register_fn("echo", |v| Ok(json!({"got": v})));
        let (dispatcher, transport) = dispatcher_with(registry);

        let outcome = dispatcher
            .handle_incoming("$iothub/methods/POST/echo/?$rid=9", br#"{"n":1}"#)
            .await;
        assert_eq!(outcome, DispatchOutcome::Replied { status_code: 200 });

        let published = transport.get_published_messages().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "$iothub/methods/res/200/?$rid=9");
        let body: Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body, json!({"got": {"n": 1}}));
    }

    #[tokio::test]
    async fn test_non_invoke_topics_are_ignored() {
        let (dispatcher, transport) = dispatcher_with(CommandRegistry::new());

        assert_eq!(
            dispatcher
                .handle_incoming("devices/dev1/messages/devicebound/%24.to=x", b"hello")
                .await,
            DispatchOutcome::Ignored
        );
        assert_eq!(
            dispatcher.handle_incoming("some/other/topic", b"{}").await,
            DispatchOutcome::Ignored
        );
        assert!(transport.get_published_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_rid_is_dropped() {
        let registry = CommandRegistry::new().register_fn("ping", |_| Ok(json!({})));
        let (dispatcher, transport) = dispatcher_with(registry);

        let outcome = dispatcher
            .handle_incoming("$iothub/methods/POST/ping/", b"{}")
            .await;
        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert_eq!(
            dispatcher.handle_incoming("$iothub/methods/POST/", b"{}").await,
            DispatchOutcome::Dropped
        );
        assert!(transport.get_published_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_drop_policy_for_unknown_command() {
        let (dispatcher, transport) = dispatcher_with(CommandRegistry::new());
        let dispatcher = dispatcher.with_unknown_command_policy(UnknownCommandPolicy::Drop);

        let outcome = dispatcher
            .handle_incoming("$iothub/methods/POST/reboot/?$rid=3", b"{}")
            .await;
        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert!(transport.get_published_messages().await.is_empty());
    }

    struct SlowCommand {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler for SlowCommand {
        async fn handle(&self, _payload: Value) -> CommandResult<Value> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    fn inbound(method: &str, rid: usize) -> InboundMessage {
        InboundMessage {
            topic: format!("$iothub/methods/POST/{method}/?$rid={rid}"),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_run_bounds_concurrent_invocations() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = CommandRegistry::new().register(
            "slow",
            SlowCommand {
                running: running.clone(),
                peak: peak.clone(),
            },
        );
        let (dispatcher, transport) = dispatcher_with(registry);
        let dispatcher = Arc::new(dispatcher.with_max_concurrent_commands(2));

        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(rx, shutdown_rx));

        for rid in 0..6 {
            tx.send(inbound("slow", rid)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.get_published_messages().await.len() < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all invocations should be answered");

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        shutdown_tx.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_while_all_slots_busy() {
        let registry = CommandRegistry::new().register(
            "slow",
            SlowCommand {
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            },
        );
        let (dispatcher, _transport) = dispatcher_with(registry);
        let dispatcher = Arc::new(
            dispatcher
                .with_max_concurrent_commands(1)
                .with_handler_timeout(Duration::from_secs(5)),
        );

        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(rx, shutdown_rx));
        tx.send(inbound("slow", 1)).await.unwrap();
        tx.send(inbound("slow", 2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher should stop while waiting for a slot")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (dispatcher, _transport) = dispatcher_with(CommandRegistry::new());
        let (_tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(dispatcher).run(rx, shutdown_rx));
        shutdown_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher should stop")
            .unwrap();
    }
}
