//! Message routing and dispatch for MQTT events
//!
//! `route_mqtt_event` is a pure classification of rumqttc events. The
//! [`MessageDispatcher`] is the single dispatch path of a connector: every
//! inbound publish is fanned out to `messages()` receivers and offered to the
//! one-shot watchers registered by checked publishes.

use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, Event};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

/// Default capacity of the inbound broadcast channel
pub const DEFAULT_DISPATCH_CAPACITY: usize = 256;

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl InboundMessage {
    /// Payload as UTF-8 text, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload parsed as JSON
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker accepted the session, possibly announcing a packet size limit
    ConnectionAcknowledged { broker_max_packet_size: Option<u32> },
    MessageReceived(InboundMessage),
    /// Broker sent DISCONNECT
    Disconnected,
    SubscriptionConfirmed { packet_id: u16, filters: usize },
    /// PingResp, PubAck and other bookkeeping packets
    InfrastructureEvent(String),
    /// Outgoing packets are handled by rumqttc
    OutgoingEvent,
}

/// Pure routing of rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                        broker_max_packet_size: connack
                            .properties
                            .as_ref()
                            .and_then(|props| props.max_packet_size),
                    },
                    Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                        topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                        payload: publish.payload.clone(),
                        qos: publish.qos,
                        retain: publish.retain,
                    }),
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                        filters: suback.return_codes.len(),
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Value a watcher waits for
///
/// Inbound JSON payloads are compared as parsed values, so key order and
/// whitespace differences still match. Non-JSON payloads are compared
/// byte-for-byte with `text`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedPayload {
    pub value: Value,
    pub text: String,
}

impl ExpectedPayload {
    pub fn new(value: Value, text: impl Into<String>) -> Self {
        Self {
            value,
            text: text.into(),
        }
    }

    /// Build from serialized JSON text
    pub fn from_text(text: impl Into<String>) -> Result<Self, serde_json::Error> {
        let text = text.into();
        let value = serde_json::from_str(&text)?;
        Ok(Self { value, text })
    }

    pub fn matches(&self, payload: &[u8]) -> bool {
        match serde_json::from_slice::<Value>(payload) {
            Ok(received) => received == self.value,
            Err(_) => payload == self.text.as_bytes(),
        }
    }
}

struct Watcher {
    id: u64,
    expected: ExpectedPayload,
    notify: oneshot::Sender<Instant>,
}

type WatcherRegistry = HashMap<String, Vec<Watcher>>;

/// Shared dispatch path of one connector
pub struct MessageDispatcher {
    messages_tx: broadcast::Sender<InboundMessage>,
    watchers: Mutex<WatcherRegistry>,
    next_watcher_id: AtomicU64,
}

impl MessageDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (messages_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            messages_tx,
            watchers: Mutex::new(HashMap::new()),
            next_watcher_id: AtomicU64::new(1),
        }
    }

    /// New receiver for every inbound message from now on
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages_tx.subscribe()
    }

    fn registry(&self) -> MutexGuard<'_, WatcherRegistry> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a one-shot watcher for `topic`
    ///
    /// The receiver resolves with the arrival instant of the matching
    /// message. Dropping the returned handle removes the watcher.
    pub fn register_watcher(
        self: &Arc<Self>,
        topic: &str,
        expected: ExpectedPayload,
    ) -> (WatchHandle, oneshot::Receiver<Instant>) {
        let (notify, receiver) = oneshot::channel();
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);

        self.registry()
            .entry(topic.to_string())
            .or_default()
            .push(Watcher {
                id,
                expected,
                notify,
            });

        let handle = WatchHandle {
            dispatcher: Arc::clone(self),
            topic: topic.to_string(),
            id,
        };
        (handle, receiver)
    }

    fn remove_watcher(&self, topic: &str, id: u64) {
        let mut registry = self.registry();
        if let Some(watchers) = registry.get_mut(topic) {
            watchers.retain(|w| w.id != id);
            if watchers.is_empty() {
                registry.remove(topic);
            }
        }
    }

    /// Deliver one inbound message
    ///
    /// Returns true when the message confirmed a watcher. Retained messages
    /// are broadcast but never confirm a watcher, and one message confirms at
    /// most one watcher: the oldest pending one on that topic that matches.
    pub fn dispatch(&self, message: InboundMessage) -> bool {
        let confirmed = if message.retain {
            false
        } else {
            self.confirm_watcher(&message.topic, &message.payload)
        };

        // No receivers is fine
        let _ = self.messages_tx.send(message);
        confirmed
    }

    fn confirm_watcher(&self, topic: &str, payload: &[u8]) -> bool {
        let now = Instant::now();
        let mut registry = self.registry();
        let Some(watchers) = registry.get_mut(topic) else {
            return false;
        };

        // Watchers whose caller already gave up are skipped and pruned
        watchers.retain(|w| !w.notify.is_closed());

        let confirmed = match watchers.iter().position(|w| w.expected.matches(payload)) {
            Some(index) => {
                let watcher = watchers.remove(index);
                watcher.notify.send(now).is_ok()
            }
            None => false,
        };

        if watchers.is_empty() {
            registry.remove(topic);
        }
        if confirmed {
            debug!(target: "mqtt_transport", topic, "Checked publish confirmed");
        }
        confirmed
    }

    pub fn pending_watchers(&self) -> usize {
        self.registry().values().map(Vec::len).sum()
    }

    pub fn pending_watchers_for(&self, topic: &str) -> usize {
        self.registry().get(topic).map_or(0, Vec::len)
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DISPATCH_CAPACITY)
    }
}

/// Removes its watcher when dropped
pub struct WatchHandle {
    dispatcher: Arc<MessageDispatcher>,
    topic: String,
    id: u64,
}

impl WatchHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.dispatcher.remove_watcher(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::Publish;
    use serde_json::json;

    fn inbound(topic: &str, payload: &str, retain: bool) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
            qos: QoS::AtMostOnce,
            retain,
        }
    }

    fn expected(value: Value) -> ExpectedPayload {
        let text = value.to_string();
        ExpectedPayload::new(value, text)
    }

    #[test]
    fn test_route_mqtt_event() {
        use rumqttc::v5::mqttbytes::v5::{
            ConnAck, ConnAckProperties, ConnectReturnCode, Disconnect, Packet,
        };

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged {
                broker_max_packet_size: None
            }
        ));

        let limited = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: Some(ConnAckProperties {
                session_expiry_interval: None,
                receive_max: None,
                max_qos: None,
                retain_available: None,
                max_packet_size: Some(1024),
                assigned_client_identifier: None,
                topic_alias_max: None,
                reason_string: None,
                user_properties: Vec::new(),
                wildcard_subscription_available: None,
                subscription_identifiers_available: None,
                shared_subscription_available: None,
                server_keep_alive: None,
                response_information: None,
                server_reference: None,
                authentication_method: None,
                authentication_data: None,
            }),
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&limited),
            EventRoute::ConnectionAcknowledged {
                broker_max_packet_size: Some(1024)
            }
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("test/echo"),
            pkid: 1,
            payload: Bytes::from(r#"{"step":1}"#),
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "test/echo");
                assert_eq!(message.payload_str(), Some(r#"{"step":1}"#));
                assert_eq!(message.json().unwrap(), json!({"step": 1}));
                assert_eq!(message.qos, QoS::AtLeastOnce);
                assert!(message.retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_expected_payload_matching() {
        let expected = ExpectedPayload::from_text(r#"{"step":1,"name":"a"}"#).unwrap();

        // Parsed JSON equality ignores key order and whitespace
        assert!(expected.matches(br#"{ "name": "a", "step": 1 }"#));
        assert!(!expected.matches(br#"{"step":2,"name":"a"}"#));
        assert!(!expected.matches(b"not json"));

        // Non-JSON inbound bytes fall back to text equality
        let raw = ExpectedPayload::new(Value::Null, "plain");
        assert!(raw.matches(b"plain"));
        assert!(!raw.matches(b"other"));
    }

    #[tokio::test]
    async fn test_dispatch_confirms_matching_watcher() {
        let dispatcher = Arc::new(MessageDispatcher::default());
        let (handle, receiver) =
            dispatcher.register_watcher("test/echo", expected(json!({"step": 1})));
        assert_eq!(dispatcher.pending_watchers_for("test/echo"), 1);

        // Wrong topic, wrong payload, retained echo: none confirm
        assert!(!dispatcher.dispatch(inbound("test/other", r#"{"step":1}"#, false)));
        assert!(!dispatcher.dispatch(inbound("test/echo", r#"{"step":2}"#, false)));
        assert!(!dispatcher.dispatch(inbound("test/echo", r#"{"step":1}"#, true)));

        assert!(dispatcher.dispatch(inbound("test/echo", r#"{"step":1}"#, false)));
        assert!(receiver.await.is_ok());
        assert_eq!(dispatcher.pending_watchers(), 0);
        drop(handle);
        assert_eq!(dispatcher.pending_watchers(), 0);
    }

    #[test]
    fn test_one_delivery_confirms_one_watcher() {
        let dispatcher = Arc::new(MessageDispatcher::default());
        let (_first_handle, mut first) =
            dispatcher.register_watcher("test/echo", expected(json!({"step": 1})));
        let (_second_handle, mut second) =
            dispatcher.register_watcher("test/echo", expected(json!({"step": 1})));

        assert!(dispatcher.dispatch(inbound("test/echo", r#"{"step":1}"#, false)));
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_err());
        assert_eq!(dispatcher.pending_watchers_for("test/echo"), 1);

        assert!(dispatcher.dispatch(inbound("test/echo", r#"{"step":1}"#, false)));
        assert!(second.try_recv().is_ok());
        assert_eq!(dispatcher.pending_watchers(), 0);
    }

    #[test]
    fn test_matching_skips_non_matching_older_watcher() {
        let dispatcher = Arc::new(MessageDispatcher::default());
        let (_a_handle, mut a) =
            dispatcher.register_watcher("test/echo", expected(json!({"step": 1})));
        let (_b_handle, mut b) =
            dispatcher.register_watcher("test/echo", expected(json!({"step": 2})));

        assert!(dispatcher.dispatch(inbound("test/echo", r#"{"step":2}"#, false)));
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_ok());
        assert_eq!(dispatcher.pending_watchers_for("test/echo"), 1);
    }

    #[test]
    fn test_dropping_handle_removes_watcher() {
        let dispatcher = Arc::new(MessageDispatcher::default());
        let (handle, _receiver) =
            dispatcher.register_watcher("test/echo", expected(json!({"step": 1})));
        assert_eq!(handle.topic(), "test/echo");
        assert_eq!(dispatcher.pending_watchers(), 1);

        drop(handle);
        assert_eq!(dispatcher.pending_watchers(), 0);
        assert!(!dispatcher.dispatch(inbound("test/echo", r#"{"step":1}"#, false)));
    }

    #[test]
    fn test_abandoned_watcher_does_not_swallow_delivery() {
        let dispatcher = Arc::new(MessageDispatcher::default());
        let (_stale_handle, stale) =
            dispatcher.register_watcher("test/echo", expected(json!({"step": 1})));
        let (_live_handle, mut live) =
            dispatcher.register_watcher("test/echo", expected(json!({"step": 1})));
        drop(stale);

        assert!(dispatcher.dispatch(inbound("test/echo", r#"{"step":1}"#, false)));
        assert!(live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_receives_all_messages() {
        let dispatcher = MessageDispatcher::new(8);
        let mut receiver = dispatcher.subscribe();

        dispatcher.dispatch(inbound("city/weather/state", r#"{"tick":1}"#, false));
        dispatcher.dispatch(inbound("city/weather/state", r#"{"tick":2}"#, true));

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        assert_eq!(first.payload_str(), Some(r#"{"tick":1}"#));
        assert!(second.retain);
    }
}
