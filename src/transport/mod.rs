//! Transport layer: broker connections and publishing

pub mod mqtt;

pub use mqtt::{ConnectorSet, MqttConnector, MqttPublisher};
