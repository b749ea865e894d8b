//! Wire-level vocabulary of the IoT hub MQTT dialect
//!
//! Topic construction/parsing and the JSON payload shapes exchanged with the broker.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
