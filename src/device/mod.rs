//! Device-side session logic
//!
//! - [`reconnect`] - Pure retry/backoff policy
//! - [`connection`] - Connection lifecycle and transport callbacks
//! - [`publisher`] - Telemetry and reply publishing
//! - [`dispatcher`] - Direct-method routing
//! - [`commands`] - Built-in `ping` / `ping_verbose`
//! - [`telemetry`] - Periodic telemetry loop
//! - [`runtime`] - Wires the above together

pub mod commands;
pub mod connection;
pub mod dispatcher;
pub mod publisher;
pub mod reconnect;
pub mod runtime;
pub mod telemetry;

pub use commands::{builtin_registry, PingCommand, PingVerboseCommand};
pub use connection::{ConnectionError, ConnectionManager, ConnectionState};
pub use dispatcher::{CommandDispatcher, CommandHandler, CommandRegistry, DispatchOutcome, FnCommand};
pub use publisher::{PublishOutcome, Publisher};
pub use reconnect::{ReconnectConfig, ReconnectPolicy, RetryDecision};
pub use runtime::DeviceRuntime;
pub use telemetry::{run_telemetry_loop, HeartbeatSource, TelemetrySource};
