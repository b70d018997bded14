//! Impure I/O for one broker connection
//!
//! [`MqttConnector`] owns a rumqttc client and the background task that polls
//! its event loop. The task applies connection events to a watch channel,
//! re-issues subscriptions after every ConnAck, feeds inbound publishes to
//! the [`MessageDispatcher`] and backs off between failed reconnects.

use super::connection::{
    configure_mqtt_options, make_client_id, publish_packet_size, qos_from_level, ClientIdGenerator,
    ConnectionState, MqttError, RandomClientId, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, InboundMessage, MessageDispatcher, MessageHandler};
use crate::config::BrokerConfig;
use crate::protocol::topics::{validate_publish_topic, validate_subscribe_filter};
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, ConnectionError, EventLoop};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `disconnect()` lets the event loop flush DISCONNECT on its own
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Upper bound for the event loop task to stop after the shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type SubscriptionTable = Arc<RwLock<HashMap<String, QoS>>>;

#[derive(Debug, Default)]
struct ConnectionStats {
    connect_time: Option<Instant>,
    last_message_time: Option<Instant>,
    sessions: u32,
    messages_received: u64,
    /// Maximum Packet Size from the latest ConnAck
    broker_max_packet_size: Option<usize>,
}

type SharedStats = Arc<StdMutex<ConnectionStats>>;

fn lock_stats(stats: &SharedStats) -> std::sync::MutexGuard<'_, ConnectionStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply one event to the shared state; returns true if the state changed
fn apply_event(
    client_id: &str,
    state_tx: &watch::Sender<ConnectionState>,
    event: ConnectionEvent,
) -> bool {
    state_tx.send_if_modified(|state| {
        let next = HealthMonitor::determine_next_state(state, event);
        if next == *state {
            return false;
        }
        HealthMonitor::log_state_transition(client_id, state, &next);
        *state = next;
        true
    })
}

/// Running event loop task and its shutdown signal
struct LoopTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LoopTask {
    /// Stop the task, waiting `grace` for it to end on its own first
    async fn stop(mut self, grace: Option<Duration>) {
        if let Some(grace) = grace {
            if tokio::time::timeout(grace, &mut self.handle).await.is_ok() {
                debug!(target: "mqtt_transport", "Event loop ended after DISCONNECT");
                return;
            }
        }

        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut self.handle).await {
            Ok(Ok(())) => debug!(target: "mqtt_transport", "Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                self.handle.abort();
            }
        }
    }
}

/// Everything the background task needs, cloned out of the connector
struct LoopContext {
    client_id: String,
    client: AsyncClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    subscriptions: SubscriptionTable,
    dispatcher: Arc<MessageDispatcher>,
    stats: SharedStats,
    reconnect_config: ReconnectConfig,
}

impl LoopContext {
    async fn run(self, mut event_loop: EventLoop, mut shutdown_rx: watch::Receiver<bool>) {
        info!(client_id = %self.client_id, "Starting MQTT event loop");
        let mut failed_attempts = 0u32;

        loop {
            tokio::select! {
                biased;

                // Also fires if the connector (and its sender) is gone
                _ = shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping event loop");
                    break;
                }

                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut failed_attempts)
                        }
                        Err(e) => {
                            let shutdown = shutdown_rx.clone();
                            self.handle_event_loop_error(e, &mut failed_attempts, shutdown)
                                .await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        // A loop that is gone cannot back a Connected or Connecting state
        let state = self.state_tx.borrow().clone();
        if matches!(state, ConnectionState::Connected | ConnectionState::Connecting) {
            apply_event(
                &self.client_id,
                &self.state_tx,
                ConnectionEvent::DisconnectRequested,
            );
        }
        info!(client_id = %self.client_id, "MQTT event loop stopped");
    }

    /// Returns false when the loop should stop
    fn process_event_route(&self, route: EventRoute, failed_attempts: &mut u32) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged {
                broker_max_packet_size,
            } => {
                lock_stats(&self.stats).broker_max_packet_size =
                    broker_max_packet_size.and_then(|max| usize::try_from(max).ok());
                if apply_event(
                    &self.client_id,
                    &self.state_tx,
                    ConnectionEvent::ConnAckReceived,
                ) {
                    *failed_attempts = 0;
                    {
                        let mut stats = lock_stats(&self.stats);
                        stats.connect_time = Some(Instant::now());
                        stats.sessions = stats.sessions.saturating_add(1);
                    }
                    self.resubscribe_to_topics();
                }
                true
            }
            EventRoute::MessageReceived(message) => {
                {
                    let mut stats = lock_stats(&self.stats);
                    stats.last_message_time = Some(Instant::now());
                    stats.messages_received = stats.messages_received.saturating_add(1);
                }
                debug!(
                    target: "mqtt_transport",
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    retain = message.retain,
                    "Received MQTT message"
                );
                self.dispatcher.dispatch(message);
                true
            }
            EventRoute::Disconnected => {
                warn!(client_id = %self.client_id, "Broker sent DISCONNECT");
                apply_event(
                    &self.client_id,
                    &self.state_tx,
                    ConnectionEvent::ConnectionLost("broker sent DISCONNECT".to_string()),
                );
                true
            }
            EventRoute::SubscriptionConfirmed { packet_id, filters } => {
                debug!(target: "mqtt_transport", packet_id, filters, "Subscription confirmed");
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns false when the loop should stop
    async fn handle_event_loop_error(
        &self,
        error: ConnectionError,
        failed_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        // disconnect() already moved us to Disconnected; the error is the socket closing
        if *self.state_tx.borrow() == ConnectionState::Disconnected {
            debug!(target: "mqtt_transport", "Event loop closed after disconnect: {}", error);
            return false;
        }

        if let ConnectionError::ConnectionRefused(code) = &error {
            apply_event(
                &self.client_id,
                &self.state_tx,
                ConnectionEvent::ConnectionRefused(format!("broker refused connection: {code:?}")),
            );
            return false;
        }

        error!(client_id = %self.client_id, "MQTT event loop error: {}", error);
        lock_stats(&self.stats).connect_time = None;
        apply_event(
            &self.client_id,
            &self.state_tx,
            ConnectionEvent::ConnectionLost(error.to_string()),
        );

        let decision = HealthMonitor::should_attempt_reconnection(
            *failed_attempts,
            &self.reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *failed_attempts = attempt;
                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );
                interruptible_sleep(shutdown_rx, delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!("Max reconnection attempts ({}) exceeded", *failed_attempts);
                apply_event(
                    &self.client_id,
                    &self.state_tx,
                    ConnectionEvent::RetriesExhausted(reason),
                );
                false
            }
        }
    }

    /// Sessions start clean, so every tracked filter is subscribed again
    fn resubscribe_to_topics(&self) {
        let subscriptions: Vec<(String, QoS)> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect();

        for (filter, qos) in subscriptions {
            // try_subscribe: the request channel is drained by this very task
            if let Err(e) = self.client.try_subscribe(filter.clone(), qos) {
                error!("Failed to re-subscribe to {}: {}", filter, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", filter);
            }
        }
    }
}

/// Returns true if the sleep completed, false if shutdown was requested
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => {
            info!("Shutdown signal received during reconnection delay, stopping");
            false
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

/// One managed connection to one broker profile
pub struct MqttConnector {
    profile: String,
    config: BrokerConfig,
    client_id: String,
    reconnect_config: ReconnectConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    client: Mutex<Option<AsyncClient>>,
    lifecycle: Mutex<Option<LoopTask>>,
    subscriptions: SubscriptionTable,
    dispatcher: Arc<MessageDispatcher>,
    stats: SharedStats,
}

impl MqttConnector {
    /// Connector with a random client-id suffix
    pub fn new(profile: impl Into<String>, config: BrokerConfig) -> Self {
        Self::with_client_id_generator(profile, config, &RandomClientId)
    }

    /// Connector whose client-id suffix comes from `generator`
    pub fn with_client_id_generator(
        profile: impl Into<String>,
        config: BrokerConfig,
        generator: &dyn ClientIdGenerator,
    ) -> Self {
        let client_id = make_client_id(&config.client_id_prefix, &generator.suffix());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            profile: profile.into(),
            config,
            client_id,
            reconnect_config: ReconnectConfig::default(),
            state_tx: Arc::new(state_tx),
            client: Mutex::new(None),
            lifecycle: Mutex::new(None),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            dispatcher: Arc::new(MessageDispatcher::default()),
            stats: Arc::new(StdMutex::new(ConnectionStats::default())),
        }
    }

    /// Replace the reconnection policy; takes effect on the next `connect()`
    pub fn with_reconnect_config(
        mut self,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        HealthMonitor::validate_reconnect_config(&reconnect_config)
            .map_err(MqttError::InvalidReconnectConfig)?;
        self.reconnect_config = reconnect_config;
        Ok(self)
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Profile's default QoS, falling back to 0 for out-of-range values
    pub fn default_qos(&self) -> QoS {
        qos_from_level(self.config.qos).unwrap_or(QoS::AtMostOnce)
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    /// Receiver that observes every state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Every inbound message from now on, in transport order
    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.dispatcher.subscribe()
    }

    pub(crate) fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Filters currently tracked for re-subscription
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        filters.sort();
        filters
    }

    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(filter)
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let stats = lock_stats(&self.stats);
        let connect_time = if self.is_connected() {
            stats.connect_time
        } else {
            None
        };
        HealthMonitor::calculate_health_metrics(
            connect_time,
            stats.last_message_time,
            stats.sessions.saturating_sub(1),
            stats.messages_received,
        )
    }

    /// Start the background event loop
    ///
    /// Returns immediately; the handshake happens on the background task and
    /// is observable through [`state`](Self::state) and
    /// [`wait_for_connection`](Self::wait_for_connection). Calling this while
    /// already connecting or connected does nothing.
    pub async fn connect(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        let running = lifecycle
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished());
        let active = matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if running && active {
            debug!(client_id = %self.client_id, "connect() called while already active");
            return;
        }

        // A previous loop that ended in Failed or after disconnect
        if let Some(task) = lifecycle.take() {
            task.stop(None).await;
        }

        let options = configure_mqtt_options(&self.config, &self.client_id);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        *self.client.lock().await = Some(client.clone());

        apply_event(
            &self.client_id,
            &self.state_tx,
            ConnectionEvent::ConnectRequested,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = LoopContext {
            client_id: self.client_id.clone(),
            client,
            state_tx: Arc::clone(&self.state_tx),
            subscriptions: Arc::clone(&self.subscriptions),
            dispatcher: Arc::clone(&self.dispatcher),
            stats: Arc::clone(&self.stats),
            reconnect_config: self.reconnect_config.clone(),
        };

        let span = crate::mqtt_span!(
            profile = %self.profile,
            client_id = %self.client_id,
            broker = %self.config.address()
        );
        let handle = tokio::spawn(context.run(event_loop, shutdown_rx).instrument(span));

        *lifecycle = Some(LoopTask {
            shutdown_tx,
            handle,
        });
        info!(
            profile = %self.profile,
            client_id = %self.client_id,
            broker = %self.config.address(),
            "Connecting to MQTT broker"
        );
    }

    /// Wait until Connected or until `timeout` elapses
    ///
    /// A zero timeout checks the current state once without waiting.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        if timeout.is_zero() {
            return state_rx.borrow().is_connected();
        }

        let result =
            tokio::time::timeout(timeout, state_rx.wait_for(ConnectionState::is_connected)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Stop the event loop and close the session
    ///
    /// Safe to call repeatedly and before `connect()`.
    pub async fn disconnect(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let was_connected = self.is_connected();

        apply_event(
            &self.client_id,
            &self.state_tx,
            ConnectionEvent::DisconnectRequested,
        );

        if let Some(client) = self.client.lock().await.take() {
            if was_connected {
                if let Err(e) = client.try_disconnect() {
                    debug!(target: "mqtt_transport", "DISCONNECT not queued: {}", e);
                }
            }
        }

        if let Some(task) = lifecycle.take() {
            task.stop(was_connected.then_some(DISCONNECT_GRACE)).await;
            info!(client_id = %self.client_id, "MQTT connector disconnected");
        }
        lock_stats(&self.stats).connect_time = None;
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.state();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    fn check_subscription_state(&self) -> Result<(), MqttError> {
        let current_state = self.state();
        if !HealthMonitor::can_subscribe(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    async fn current_client(&self) -> Result<AsyncClient, MqttError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| MqttError::NotConnected {
                state: self.state(),
            })
    }

    /// Subscribe to a topic filter and track it for re-subscription
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), MqttError> {
        validate_subscribe_filter(filter)?;
        self.check_subscription_state()?;

        let client = self.current_client().await?;
        client
            .subscribe(filter.to_string(), qos)
            .await
            .map_err(|e| {
                let reason = format!("Failed to subscribe to {filter}: {e}");
                MqttError::SubscriptionFailed(reason.into())
            })?;

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(filter.to_string(), qos);
        info!("Subscribed to: {}", filter);
        Ok(())
    }

    /// Subscribe unless the filter is already tracked
    pub async fn ensure_subscribed(&self, filter: &str, qos: QoS) -> Result<(), MqttError> {
        if self.is_subscribed(filter) {
            self.check_subscription_state()?;
            return Ok(());
        }
        self.subscribe(filter, qos).await
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        validate_subscribe_filter(filter)?;
        self.check_subscription_state()?;

        let client = self.current_client().await?;
        client.unsubscribe(filter.to_string()).await.map_err(|e| {
            let reason = format!("Failed to unsubscribe from {filter}: {e}");
            MqttError::SubscriptionFailed(reason.into())
        })?;

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(filter);
        info!("Unsubscribed from: {}", filter);
        Ok(())
    }

    /// Queue raw bytes for publishing
    ///
    /// Success means the request reached the local client, not the broker.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        validate_publish_topic(topic)?;
        self.check_connection_state()?;

        let payload: Bytes = payload.into();
        self.check_payload_size(topic, payload.len(), qos)?;

        let client = self.current_client().await?;
        client
            .publish(topic.to_string(), qos, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", topic, "Published message");
        Ok(())
    }

    /// Largest PUBLISH packet allowed: the profile limit, lowered by the broker's ConnAck
    pub fn max_packet_size(&self) -> usize {
        let broker_max = lock_stats(&self.stats).broker_max_packet_size;
        broker_max.map_or(self.config.max_packet_size, |broker| {
            broker.min(self.config.max_packet_size)
        })
    }

    /// Reject a publish whose encoded packet, topic and headers included, exceeds the limit
    pub(crate) fn check_payload_size(
        &self,
        topic: &str,
        payload_len: usize,
        qos: QoS,
    ) -> Result<(), MqttError> {
        let size = publish_packet_size(topic, payload_len, qos);
        let max = self.max_packet_size();
        if size > max {
            return Err(MqttError::PayloadTooLarge { size, max });
        }
        Ok(())
    }
}

impl std::fmt::Debug for MqttConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnector")
            .field("profile", &self.profile)
            .field("client_id", &self.client_id)
            .field("broker", &self.config.address())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for MqttConnector {
    fn drop(&mut self) {
        if let Some(task) = self.lifecycle.get_mut().take() {
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::connection::FixedClientId;

    fn unreachable_config() -> BrokerConfig {
        // Port 1 on localhost refuses connections immediately
        BrokerConfig {
            port: 1,
            client_id_prefix: "unit".to_string(),
            ..BrokerConfig::local()
        }
    }

    #[test]
    fn test_client_id_uses_generator() {
        let connector = MqttConnector::with_client_id_generator(
            "local",
            BrokerConfig::local(),
            &FixedClientId("abc123".to_string()),
        );
        assert_eq!(connector.client_id(), "simcity-abc123");
        assert_eq!(connector.profile(), "local");
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_random_client_ids_are_distinct() {
        let a = MqttConnector::new("local", BrokerConfig::local());
        let b = MqttConnector::new("local", BrokerConfig::local());
        assert_ne!(a.client_id(), b.client_id());
    }

    #[tokio::test]
    async fn test_wait_for_connection_zero_timeout_returns_immediately() {
        let connector = MqttConnector::new("local", BrokerConfig::local());
        let started = Instant::now();
        assert!(!connector.wait_for_connection(Duration::ZERO).await);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_for_connection_times_out_before_connect() {
        let connector = MqttConnector::new("local", BrokerConfig::local());
        assert!(!connector.wait_for_connection(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_safe() {
        let connector = MqttConnector::new("local", BrokerConfig::local());
        connector.disconnect().await;
        connector.disconnect().await;
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let connector = MqttConnector::new("local", BrokerConfig::local());

        assert!(matches!(
            connector.subscribe("test/echo", QoS::AtMostOnce).await,
            Err(MqttError::NotConnected { .. })
        ));
        assert!(matches!(
            connector.unsubscribe("test/echo").await,
            Err(MqttError::NotConnected { .. })
        ));
        assert!(matches!(
            connector
                .publish("test/echo", b"{}".to_vec(), QoS::AtMostOnce, false)
                .await,
            Err(MqttError::NotConnected { .. })
        ));
        assert!(connector.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_topics_rejected_before_state_check() {
        let connector = MqttConnector::new("local", BrokerConfig::local());
        assert!(matches!(
            connector
                .publish("city/+/state", b"{}".to_vec(), QoS::AtMostOnce, false)
                .await,
            Err(MqttError::InvalidTopic(_))
        ));
        assert!(matches!(
            connector.subscribe("city/#/state", QoS::AtMostOnce).await,
            Err(MqttError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_broker_stays_connecting() {
        let connector = MqttConnector::new("local", unreachable_config());
        connector.connect().await;

        assert!(!connector.wait_for_connection(Duration::from_millis(300)).await);
        // Network errors are retried, never reported as Failed
        assert_eq!(connector.state(), ConnectionState::Connecting);

        // Idempotent while active
        connector.connect().await;
        assert_eq!(connector.state(), ConnectionState::Connecting);

        connector.disconnect().await;
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_retries_exhausted_moves_to_failed() {
        let fast_failure = ReconnectConfig {
            max_attempts: Some(1),
            initial_delay_ms: 10,
            max_delay_ms: 10,
            multiplier: 2,
        };
        let connector = MqttConnector::new("local", unreachable_config())
            .with_reconnect_config(fast_failure)
            .unwrap();
        connector.connect().await;

        let mut states = connector.state_changes();
        let failed = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(ConnectionState::is_failed),
        )
        .await;
        assert!(matches!(failed, Ok(Ok(_))));

        // connect() restarts from Failed
        connector.connect().await;
        assert_eq!(connector.state(), ConnectionState::Connecting);
        connector.disconnect().await;
    }

    #[test]
    fn test_health_metrics_before_connect() {
        let connector = MqttConnector::new("local", BrokerConfig::local());
        let metrics = connector.health_metrics();
        assert!(metrics.uptime.is_none());
        assert_eq!(metrics.reconnect_count, 0);
        assert_eq!(metrics.messages_received, 0);
        assert!(!metrics.is_healthy);
    }

    #[test]
    fn test_with_reconnect_config_validates() {
        let invalid = [
            ReconnectConfig {
                max_attempts: Some(0),
                ..ReconnectConfig::default()
            },
            ReconnectConfig {
                initial_delay_ms: 0,
                ..ReconnectConfig::default()
            },
            ReconnectConfig {
                initial_delay_ms: 5_000,
                max_delay_ms: 1_000,
                ..ReconnectConfig::default()
            },
        ];
        for config in invalid {
            let result = MqttConnector::new("local", BrokerConfig::local())
                .with_reconnect_config(config.clone());
            assert!(
                matches!(result, Err(MqttError::InvalidReconnectConfig(_))),
                "accepted {config:?}"
            );
        }

        assert!(MqttConnector::new("local", BrokerConfig::local())
            .with_reconnect_config(ReconnectConfig::default())
            .is_ok());
    }

    #[test]
    fn test_packet_size_limit_counts_topic_and_headers() {
        // "test/echo" with 10 payload bytes encodes to 24 bytes at QoS 0, 26 at QoS 1
        let connector = MqttConnector::new(
            "local",
            BrokerConfig {
                max_packet_size: 24,
                ..BrokerConfig::local()
            },
        );
        assert!(connector
            .check_payload_size("test/echo", 10, QoS::AtMostOnce)
            .is_ok());
        // Payload alone fits, the packet does not
        assert!(matches!(
            connector.check_payload_size("test/echo", 11, QoS::AtMostOnce),
            Err(MqttError::PayloadTooLarge { size: 25, max: 24 })
        ));
        assert!(matches!(
            connector.check_payload_size("test/echo", 10, QoS::AtLeastOnce),
            Err(MqttError::PayloadTooLarge { size: 26, max: 24 })
        ));
        assert!(matches!(
            connector.check_payload_size("test/echo/longer", 10, QoS::AtMostOnce),
            Err(MqttError::PayloadTooLarge { max: 24, .. })
        ));
    }

    #[test]
    fn test_broker_packet_limit_lowers_profile_limit() {
        let connector = MqttConnector::new("local", BrokerConfig::local());
        assert_eq!(connector.max_packet_size(), BrokerConfig::local().max_packet_size);

        lock_stats(&connector.stats).broker_max_packet_size = Some(24);
        assert_eq!(connector.max_packet_size(), 24);
        assert!(connector
            .check_payload_size("test/echo", 10, QoS::AtMostOnce)
            .is_ok());
        assert!(matches!(
            connector.check_payload_size("test/echo", 11, QoS::AtMostOnce),
            Err(MqttError::PayloadTooLarge { size: 25, max: 24 })
        ));

        // A broker limit above the profile's does not raise it
        lock_stats(&connector.stats).broker_max_packet_size = Some(usize::MAX);
        assert_eq!(connector.max_packet_size(), BrokerConfig::local().max_packet_size);
    }

    #[tokio::test]
    async fn test_publish_rejects_oversized_packet_before_sending() {
        let connector = MqttConnector::new(
            "local",
            BrokerConfig {
                max_packet_size: 24,
                ..BrokerConfig::local()
            },
        );
        // Pretend the session is up; the size check runs before any I/O
        apply_event(
            connector.client_id(),
            &connector.state_tx,
            ConnectionEvent::ConnectRequested,
        );
        apply_event(
            connector.client_id(),
            &connector.state_tx,
            ConnectionEvent::ConnAckReceived,
        );
        assert!(connector.is_connected());

        let result = connector
            .publish("test/echo", vec![b'x'; 11], QoS::AtMostOnce, false)
            .await;
        assert!(matches!(
            result,
            Err(MqttError::PayloadTooLarge { size: 25, max: 24 })
        ));
    }
}
