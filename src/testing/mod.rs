//! Testing utilities and mock implementations
//!
//! Lets the device runtime be tested without a live MQTT broker.

pub mod mocks;

pub use mocks::*;
