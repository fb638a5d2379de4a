//! spotter-bus: message bus collaborator
//!
//! Subscribes to the run/stop control topic, publishes detection messages
//! and registers the last will announcing an unexpected disconnect.

pub mod control;
pub mod error;
pub mod message;
pub mod mqtt;

pub use control::{apply_control_message, parse_control_payload};
pub use error::BusError;
pub use message::{BoxField, DetectionEntry, DetectionMessage};
pub use mqtt::{should_publish, MqttBus};
