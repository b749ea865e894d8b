//! Built-in direct methods every device answers

use super::dispatcher::{CommandHandler, CommandRegistry};
use crate::error::CommandResult;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

/// `ping`: liveness check, replies with an empty object
pub struct PingCommand;

#[async_trait]
impl CommandHandler for PingCommand {
    async fn handle(&self, payload: Value) -> CommandResult<Value> {
        info!("Received ping: {}", payload);
        Ok(json!({}))
    }
}

/// `ping_verbose`: echoes the request with the device id and current time
pub struct PingVerboseCommand {
    device_id: String,
}

impl PingVerboseCommand {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl CommandHandler for PingVerboseCommand {
    async fn handle(&self, payload: Value) -> CommandResult<Value> {
        Ok(json!({
            "device_id": self.device_id,
            "timestamp": Utc::now().to_rfc3339(),
            "echo": payload,
        }))
    }
}

/// Registry holding `ping` and `ping_verbose`
pub fn builtin_registry(device_id: &str) -> CommandRegistry {
    CommandRegistry::new()
        .register("ping", PingCommand)
        .register("ping_verbose", PingVerboseCommand::new(device_id))
}
