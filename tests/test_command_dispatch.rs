//! Direct-method dispatch tests
//!
//! Drive the dispatcher with invoke topics and assert on the replies the mock
//! transport recorded: topic, status code and JSON body.

use async_trait::async_trait;
use iothub_device::config::UnknownCommandPolicy;
use iothub_device::device::{
    builtin_registry, CommandDispatcher, CommandHandler, ConnectionManager, DispatchOutcome,
    Publisher, ReconnectConfig,
};
use iothub_device::error::{CommandError, CommandResult};
use iothub_device::testing::MockTransport;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct SlowCommand;

#[async_trait]
impl CommandHandler for SlowCommand {
    async fn handle(&self, _payload: Value) -> CommandResult<Value> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!({}))
    }
}

struct PanickingCommand;

#[async_trait]
impl CommandHandler for PanickingCommand {
    async fn handle(&self, _payload: Value) -> CommandResult<Value> {
        panic!("handler bug");
    }
}

fn test_dispatcher() -> (CommandDispatcher<MockTransport>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let manager = Arc::new(ConnectionManager::new(
        transport.clone(),
        ReconnectConfig::default(),
    ));
    let publisher = Publisher::new(manager, "test-device");

    let registry = builtin_registry("test-device")
        .register_fn("fail", |_| {
            Err(CommandError::handler_failed("sensor offline, token=abc123"))
        })
        .register("slow", SlowCommand)
        .register("explode", PanickingCommand);

    let dispatcher = CommandDispatcher::new(Arc::new(registry), publisher)
        .with_handler_timeout(Duration::from_millis(50));
    (dispatcher, transport)
}

async fn single_reply(transport: &MockTransport) -> (String, Value) {
    let published = transport.get_published_messages().await;
    assert_eq!(published.len(), 1, "expected exactly one reply: {published:?}");
    let (topic, payload) = published.into_iter().next().unwrap();
    let body = serde_json::from_slice(&payload).expect("reply body is JSON");
    (topic, body)
}

#[tokio::test]
async fn test_ping_replies_200_with_empty_object() {
    let (dispatcher, transport) = test_dispatcher();

    let outcome = dispatcher
        .handle_incoming("$iothub/methods/POST/ping/?$rid=42", b"{}")
        .await;

    assert_eq!(outcome, DispatchOutcome::Replied { status_code: 200 });
    let (topic, body) = single_reply(&transport).await;
    assert_eq!(topic, "$iothub/methods/res/200/?$rid=42");
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn test_invalid_json_replies_500_with_message() {
    let (dispatcher, transport) = test_dispatcher();

    let outcome = dispatcher
        .handle_incoming("$iothub/methods/POST/ping/?$rid=7", b"{not json")
        .await;

    assert_eq!(outcome, DispatchOutcome::Replied { status_code: 500 });
    let (topic, body) = single_reply(&transport).await;
    assert_eq!(topic, "$iothub/methods/res/500/?$rid=7");
    assert!(body["message"].as_str().unwrap().contains("not valid JSON"));
}

#[tokio::test]
async fn test_empty_payload_replies_500() {
    let (dispatcher, transport) = test_dispatcher();

    dispatcher
        .handle_incoming("$iothub/methods/POST/ping/?$rid=8", b"")
        .await;

    let (topic, body) = single_reply(&transport).await;
    assert_eq!(topic, "$iothub/methods/res/500/?$rid=8");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn test_handler_error_replies_500_and_redacts() {
    let (dispatcher, transport) = test_dispatcher();

    dispatcher
        .handle_incoming("$iothub/methods/POST/fail/?$rid=abc-1", b"{}")
        .await;

    let (topic, body) = single_reply(&transport).await;
    assert_eq!(topic, "$iothub/methods/res/500/?$rid=abc-1");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("sensor offline"));
    assert!(!message.contains("abc123"));
}

#[tokio::test]
async fn test_handler_panic_replies_500() {
    let (dispatcher, transport) = test_dispatcher();

    let outcome = dispatcher
        .handle_incoming("$iothub/methods/POST/explode/?$rid=11", b"{}")
        .await;

    assert_eq!(outcome, DispatchOutcome::Replied { status_code: 500 });
    let (_, body) = single_reply(&transport).await;
    assert!(body["message"].as_str().unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_handler_timeout_replies_500() {
    let (dispatcher, transport) = test_dispatcher();

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        dispatcher.handle_incoming("$iothub/methods/POST/slow/?$rid=12", b"{}"),
    )
    .await
    .expect("dispatch must not wait for the handler");

    assert_eq!(outcome, DispatchOutcome::Replied { status_code: 500 });
    let (topic, body) = single_reply(&transport).await;
    assert_eq!(topic, "$iothub/methods/res/500/?$rid=12");
    assert!(body["message"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_unknown_command_replies_404_by_default() {
    let (dispatcher, transport) = test_dispatcher();

    let outcome = dispatcher
        .handle_incoming("$iothub/methods/POST/reboot/?$rid=13", b"{}")
        .await;

    assert_eq!(outcome, DispatchOutcome::Replied { status_code: 404 });
    let (topic, body) = single_reply(&transport).await;
    assert_eq!(topic, "$iothub/methods/res/404/?$rid=13");
    assert!(body["message"].as_str().unwrap().contains("reboot"));
}

#[tokio::test]
async fn test_unknown_command_drop_policy() {
    let (dispatcher, transport) = test_dispatcher();
    let dispatcher = dispatcher.with_unknown_command_policy(UnknownCommandPolicy::Drop);

    let outcome = dispatcher
        .handle_incoming("$iothub/methods/POST/reboot/?$rid=14", b"{}")
        .await;

    assert_eq!(outcome, DispatchOutcome::Dropped);
    assert!(transport.get_published_messages().await.is_empty());
}

#[tokio::test]
async fn test_request_id_round_trips_unchanged() {
    let (dispatcher, transport) = test_dispatcher();
    let rid = "0f8fad5b-d9cb-469f-a165-70867728950e";

    dispatcher
        .handle_incoming(&format!("$iothub/methods/POST/ping_verbose/?$rid={rid}"), br#"{"x":1}"#)
        .await;

    let (topic, body) = single_reply(&transport).await;
    assert_eq!(topic, format!("$iothub/methods/res/200/?$rid={rid}"));
    assert_eq!(body["device_id"], "test-device");
    assert_eq!(body["echo"], json!({"x": 1}));
}

#[tokio::test]
async fn test_inbound_message_flows_from_transport_to_reply() {
    let transport = Arc::new(MockTransport::new());
    let (inbound_tx, inbound_rx) = mpsc::channel(8);
    let manager = Arc::new(
        ConnectionManager::new(transport.clone(), ReconnectConfig::default())
            .with_subscriptions(vec!["$iothub/methods/POST/#".to_string()])
            .with_message_sender(inbound_tx),
    );
    let publisher = Publisher::new(manager.clone(), "test-device");
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::new(builtin_registry("test-device")),
        publisher,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(dispatcher.run(inbound_rx, shutdown_rx));

    manager.connect().await.unwrap();
    transport
        .simulate_message("$iothub/methods/POST/ping/?$rid=99", b"{}")
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if !transport.get_published_messages().await.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no reply published");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (topic, body) = single_reply(&transport).await;
    assert_eq!(topic, "$iothub/methods/res/200/?$rid=99");
    assert_eq!(body, json!({}));

    shutdown_tx.send_replace(true);
    run.await.unwrap();
}
