//! Pure connection state, configuration and identity handling
//!
//! This module contains the connection state type, the reconnection policy,
//! the transport error type, client-id generation and the mapping from a
//! [`BrokerConfig`] to rumqttc options. Nothing here performs I/O.

use crate::config::{BrokerConfig, MIN_KEEPALIVE_SECS};
use crate::protocol::topics::TopicError;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Prefix used when a profile's `client_id_prefix` is blank
pub const FALLBACK_CLIENT_ID_PREFIX: &str = "simcity";

/// Connection state of one connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Disconnected,
    /// Handshake or automatic reconnection in progress
    Connecting,
    /// ConnAck received, ready for publish/subscribe
    Connected,
    /// Broker rejected the session or retries were exhausted; `connect()` must be called again
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    /// Short lowercase label for logs and CLI output
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed(_) => "failed",
        }
    }
}

/// Reconnection policy: exponential backoff with a cap
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between consecutive attempts
    pub multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            multiplier: 2,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay for the given attempt (1-based)
    ///
    /// 250ms, 500ms, 1s, 2s, ... capped at `max_delay_ms`.
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error: {0}")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("Invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),
    #[error("Payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Unknown broker profile: {0}")]
    UnknownProfile(String),
    #[error("Invalid reconnect configuration: {0}")]
    InvalidReconnectConfig(String),
}

/// Map a numeric QoS level to the rumqttc type
pub fn qos_from_level(level: u8) -> Result<QoS, MqttError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

/// Source of client-id suffixes, owned by the connector
///
/// Brokers drop the older session when two clients share an id, so each
/// connector needs a distinct suffix. Tests supply a fixed one.
pub trait ClientIdGenerator: Send + Sync {
    fn suffix(&self) -> String;
}

/// Eight random hex characters from a v4 UUID
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomClientId;

impl ClientIdGenerator for RandomClientId {
    fn suffix(&self) -> String {
        let simple = Uuid::new_v4().simple().to_string();
        simple[..8].to_string()
    }
}

/// Always returns the same suffix
#[derive(Debug, Clone)]
pub struct FixedClientId(pub String);

impl ClientIdGenerator for FixedClientId {
    fn suffix(&self) -> String {
        self.0.clone()
    }
}

/// Join a prefix and suffix into a client id
pub fn make_client_id(prefix: &str, suffix: &str) -> String {
    let prefix = match prefix.trim() {
        "" => FALLBACK_CLIENT_ID_PREFIX,
        trimmed => trimmed,
    };
    let suffix = suffix.trim();
    if suffix.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}-{suffix}")
    }
}

/// Length of an MQTT variable byte integer encoding `value`
fn variable_int_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Encoded size of a v5 PUBLISH without properties
///
/// Fixed header, topic, packet id (QoS 1 and 2), empty property block and
/// payload. This is the number rumqttc and the broker compare against the
/// maximum packet size.
pub fn publish_packet_size(topic: &str, payload_len: usize, qos: QoS) -> usize {
    let packet_id = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let properties = variable_int_len(0);
    let remaining = 2 + topic.len() + packet_id + properties + payload_len;
    1 + variable_int_len(remaining) + remaining
}

/// Build rumqttc options for one broker profile
pub fn configure_mqtt_options(config: &BrokerConfig, client_id: &str) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, config.host.as_str(), config.port);

    if config.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.as_str(), password);
    }

    // rumqttc panics below the minimum; config loading rejects it, hand-built configs are clamped
    let keepalive = config.keepalive_secs.max(MIN_KEEPALIVE_SECS);
    mqtt_options.set_keep_alive(Duration::from_secs(keepalive));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(u32::try_from(config.max_packet_size).ok());

    mqtt_options
}
