//! Simulated City - MQTT connector and checked publisher
//!
//! Building blocks for small publish/subscribe "agents" in a simulated city:
//! - Profile-based broker configuration loaded from TOML
//! - A connector per broker profile with a background event loop and
//!   automatic reconnection
//! - A publisher whose checked mode confirms that the broker delivered a
//!   message back before reporting success
//! - Topic helpers and typed payloads for the canonical city topics
//!
//! # Quick Start
//!
//! ```rust
//! use simulated_city::protocol::{build_topic, WeatherPayload};
//!
//! let topic = build_topic("simulated-city", &["agents", "weather"]).unwrap();
//! assert_eq!(topic, "simulated-city/agents/weather");
//!
//! let payload = WeatherPayload::new("Sunny", 1, None).unwrap();
//! let json = serde_json::to_value(&payload).unwrap();
//! assert_eq!(json["weather_state"], "sunny");
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod transport;

pub use config::{AppConfig, BrokerConfig, ConfigError};
pub use error::{SimCityError, SimCityResult};
pub use protocol::*;
pub use transport::mqtt::{
    ConnectionState, ConnectorSet, MqttConnector, MqttError, MqttPublisher, PublishCheckResult,
    PublishOutcome,
};
