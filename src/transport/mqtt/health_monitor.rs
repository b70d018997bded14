//! Pure health monitoring and reconnection logic for the connector
//!
//! State transitions, reconnection decisions and health metrics are plain
//! functions so the event loop in `connector.rs` only performs I/O.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another reconnection attempt should be made
    ///
    /// `current_attempts` counts consecutive failures since the last ConnAck.
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Next state for a connection event
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        use ConnectionState::*;

        match (current_state, event) {
            (Disconnected | Failed(_), ConnectionEvent::ConnectRequested) => Connecting,
            (Connecting, ConnectionEvent::ConnAckReceived) => Connected,
            (Connecting | Connected, ConnectionEvent::ConnectionRefused(reason)) => Failed(reason),
            (Connecting | Connected, ConnectionEvent::ConnectionLost(_)) => Connecting,
            (Connecting | Connected, ConnectionEvent::RetriesExhausted(reason)) => Failed(reason),
            (_, ConnectionEvent::DisconnectRequested) => Disconnected,
            (current, _) => current.clone(),
        }
    }

    /// Publishing requires an acknowledged session
    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    /// Subscribing requires an acknowledged session
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
        messages_received: u64,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            messages_received,
            is_healthy: uptime.is_some(),
        }
    }

    /// Log a state change at a level matching its severity
    pub fn log_state_transition(client_id: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(client_id, "MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Connecting) => {
                warn!(client_id, "MQTT connection lost, reconnecting");
            }
            (_, ConnectionState::Failed(reason)) => {
                error!(client_id, reason = %reason, "MQTT connection failed");
            }
            _ => {
                info!(
                    client_id,
                    from = from.label(),
                    to = to.label(),
                    "MQTT connection state changed"
                );
            }
        }
    }

    /// Reject reconnect policies that could never make progress
    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if config.initial_delay_ms == 0 {
            return Err("initial_delay_ms must be greater than 0".to_string());
        }
        if config.max_delay_ms < config.initial_delay_ms {
            return Err("max_delay_ms must not be smaller than initial_delay_ms".to_string());
        }
        Ok(())
    }
}

/// Outcome of a reconnection decision
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Sleep `delay_ms`, then try again
    Proceed { attempt: u32, delay_ms: u64 },
    /// The connector is shutting down
    AbortShutdownRequested,
    /// `max_attempts` consecutive failures
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// `connect()` called
    ConnectRequested,
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker rejected the CONNECT (bad credentials, banned id, ...)
    ConnectionRefused(String),
    /// Network error or broker-initiated disconnect
    ConnectionLost(String),
    /// Reconnect budget used up
    RetriesExhausted(String),
    /// `disconnect()` called
    DisconnectRequested,
}

/// Health snapshot for one connector
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current session was acknowledged
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    /// Sessions re-established after the first one
    pub reconnect_count: u32,
    pub messages_received: u64,
    pub is_healthy: bool,
}
