//! JSON publishing with optional round-trip confirmation
//!
//! A plain publish only proves the message reached the local client's
//! request queue. [`MqttPublisher::publish_json_checked`] subscribes to its
//! own target topic, publishes, and waits for the broker to deliver the same
//! payload back before reporting success.

use super::connection::MqttError;
use super::connector::MqttConnector;
use super::message_handler::ExpectedPayload;
use crate::protocol::json::to_json_string;
use crate::protocol::topics::validate_publish_topic;
use rumqttc::v5::mqttbytes::QoS;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Instrument};

/// What happened to one checked publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker delivered the payload back within the timeout
    Confirmed,
    /// No matching delivery before the deadline; the broker may still have it
    TimedOut,
    /// The local client rejected the publish or subscribe
    PublishError(String),
    /// The connector was not connected; nothing was sent
    NotConnected,
}

impl PublishOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Confirmed => "confirmed",
            PublishOutcome::TimedOut => "timed_out",
            PublishOutcome::PublishError(_) => "publish_error",
            PublishOutcome::NotConnected => "not_connected",
        }
    }
}

/// Result of one checked publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishCheckResult {
    pub topic: String,
    pub outcome: PublishOutcome,
    /// From the start of the call until confirmation or giving up
    pub elapsed: Duration,
    /// Serialized JSON that was (or would have been) sent
    pub payload: String,
}

impl PublishCheckResult {
    pub fn is_confirmed(&self) -> bool {
        self.outcome == PublishOutcome::Confirmed
    }
}

/// Publishes JSON through a shared connector
#[derive(Debug, Clone)]
pub struct MqttPublisher {
    connector: Arc<MqttConnector>,
}

impl MqttPublisher {
    pub fn new(connector: Arc<MqttConnector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> &Arc<MqttConnector> {
        &self.connector
    }

    /// Serialize and publish without waiting for the broker
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        validate_publish_topic(topic)?;
        let text = to_json_string(payload).map_err(MqttError::SerializationError)?;
        self.connector
            .publish(topic, text.into_bytes(), qos, retain)
            .await
    }

    /// Publish and wait for the broker to echo the payload back
    ///
    /// Caller mistakes are returned as errors, checked in this order: a topic
    /// that is not a concrete publish target, then a payload with no JSON
    /// representation. Everything after that is reported in the result:
    /// `NotConnected` without any I/O, `PublishError` when the local client
    /// rejects the request, `TimedOut` when no matching delivery arrives
    /// before `timeout`. The subscribe, publish and wait steps share the
    /// single `timeout` deadline.
    ///
    /// An echo matches when it arrives on `topic`, is not retained, and its
    /// payload parses as JSON equal to the published value (or, for non-JSON
    /// bytes, is byte-identical to the serialized text).
    pub async fn publish_json_checked<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        qos: QoS,
        timeout: Duration,
    ) -> Result<PublishCheckResult, MqttError> {
        let started = Instant::now();
        validate_publish_topic(topic)?;

        let text = to_json_string(payload).map_err(MqttError::SerializationError)?;
        let value: Value = serde_json::from_str(&text).map_err(MqttError::SerializationError)?;

        let span = crate::publish_span!(
            topic = %topic,
            client_id = %self.connector.client_id()
        );
        let outcome = self
            .run_checked_publish(topic, ExpectedPayload::new(value, text.clone()), qos, timeout)
            .instrument(span)
            .await;

        let (outcome, finished) = match outcome {
            CheckedStep::Confirmed(at) => (PublishOutcome::Confirmed, at),
            CheckedStep::Stopped(outcome) => (outcome, Instant::now()),
        };
        let result = PublishCheckResult {
            topic: topic.to_string(),
            outcome,
            elapsed: finished.saturating_duration_since(started),
            payload: text,
        };

        match &result.outcome {
            PublishOutcome::Confirmed => info!(
                topic,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "Checked publish confirmed"
            ),
            PublishOutcome::NotConnected => debug!(topic, "Checked publish skipped: not connected"),
            other => warn!(topic, outcome = other.label(), "Checked publish not confirmed"),
        }
        Ok(result)
    }

    async fn run_checked_publish(
        &self,
        topic: &str,
        expected: ExpectedPayload,
        qos: QoS,
        timeout: Duration,
    ) -> CheckedStep {
        let deadline = tokio::time::Instant::now() + timeout;
        let connector = &self.connector;

        if !connector.is_connected() {
            return CheckedStep::Stopped(PublishOutcome::NotConnected);
        }
        if let Err(e) = connector.check_payload_size(topic, expected.text.len(), qos) {
            return CheckedStep::Stopped(PublishOutcome::PublishError(e.to_string()));
        }

        match tokio::time::timeout_at(deadline, connector.ensure_subscribed(topic, qos)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return CheckedStep::Stopped(step_error_outcome(e)),
            Err(_) => return CheckedStep::Stopped(PublishOutcome::TimedOut),
        }

        // Registered before publishing so the echo cannot slip past; the
        // handle removes the watcher on every return path
        let text = expected.text.clone();
        let (_watch_handle, confirmation) =
            connector.dispatcher().register_watcher(topic, expected);

        let publish = connector.publish(topic, text.into_bytes(), qos, false);
        match tokio::time::timeout_at(deadline, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return CheckedStep::Stopped(step_error_outcome(e)),
            Err(_) => return CheckedStep::Stopped(PublishOutcome::TimedOut),
        }

        match wait_for_echo(confirmation, deadline).await {
            Some(at) => CheckedStep::Confirmed(at),
            None => CheckedStep::Stopped(PublishOutcome::TimedOut),
        }
    }
}

enum CheckedStep {
    Confirmed(Instant),
    Stopped(PublishOutcome),
}

/// Connection loss mid-call is reported as NotConnected, anything else as PublishError
fn step_error_outcome(error: MqttError) -> PublishOutcome {
    match error {
        MqttError::NotConnected { .. } => PublishOutcome::NotConnected,
        other => PublishOutcome::PublishError(other.to_string()),
    }
}

/// Arrival instant of the echo, or None if the deadline passed first
async fn wait_for_echo(
    confirmation: oneshot::Receiver<Instant>,
    deadline: tokio::time::Instant,
) -> Option<Instant> {
    match tokio::time::timeout_at(deadline, confirmation).await {
        Ok(Ok(at)) => Some(at),
        _ => None,
    }
}
