//! MQTT connector and checked publisher
//!
//! The module separates pure logic from I/O:
//!
//! - [`connection`] - Connection state, reconnect policy, client ids, rumqttc options
//! - [`health_monitor`] - State transitions and reconnection decisions
//! - [`message_handler`] - Event routing and the per-connector dispatch path
//! - [`connector`] - The background event loop and connection lifecycle
//! - [`publisher`] - JSON publishing with round-trip confirmation
//! - [`pool`] - One connector per active broker profile
//!
//! # Usage
//!
//! ```rust,no_run
//! use simulated_city::config::BrokerConfig;
//! use simulated_city::transport::mqtt::{MqttConnector, MqttPublisher, QoS};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Arc::new(MqttConnector::new("local", BrokerConfig::local()));
//! connector.connect().await;
//! if connector.wait_for_connection(Duration::from_secs(5)).await {
//!     let publisher = MqttPublisher::new(Arc::clone(&connector));
//!     let result = publisher
//!         .publish_json_checked(
//!             "test/echo",
//!             &serde_json::json!({"step": 1}),
//!             QoS::AtMostOnce,
//!             Duration::from_secs(2),
//!         )
//!         .await?;
//!     println!("{:?} after {:?}", result.outcome, result.elapsed);
//! }
//! connector.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod connector;
pub mod health_monitor;
pub mod message_handler;
pub mod pool;
pub mod publisher;

pub use connection::{
    make_client_id, qos_from_level, ClientIdGenerator, ConnectionState, FixedClientId,
    MqttError, RandomClientId, ReconnectConfig,
};
pub use connector::MqttConnector;
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, ExpectedPayload, InboundMessage, MessageHandler};
pub use pool::ConnectorSet;
pub use publisher::{MqttPublisher, PublishCheckResult, PublishOutcome};
pub use rumqttc::v5::mqttbytes::QoS;
