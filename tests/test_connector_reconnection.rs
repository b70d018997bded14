//! Connector behaviour against a scripted in-process broker
//!
//! A `TcpListener` plays the broker side of the MQTT 5 handshake so the
//! tests can refuse credentials, cut the link mid-session and announce a
//! packet size limit, none of which a stock Mosquitto container does on
//! demand.

use simulated_city::config::BrokerConfig;
use simulated_city::transport::mqtt::{
    ConnectionState, MqttConnector, MqttError, QoS, ReconnectConfig,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const CONNACK_ACCEPTED: [u8; 5] = [0x20, 0x03, 0x00, 0x00, 0x00];
const CONNACK_NOT_AUTHORIZED: [u8; 5] = [0x20, 0x03, 0x00, 0x87, 0x00];
/// Accepted, with a Maximum Packet Size property of 64 bytes
const CONNACK_MAX_PACKET_64: [u8; 10] = [
    0x20, 0x08, 0x00, 0x00, 0x05, 0x27, 0x00, 0x00, 0x00, 0x40,
];

const STATE_TIMEOUT: Duration = Duration::from_secs(10);

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn broker_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        port,
        client_id_prefix: "scripted".to_string(),
        ..BrokerConfig::local()
    }
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: Some(20),
        initial_delay_ms: 20,
        max_delay_ms: 100,
        multiplier: 2,
    }
}

/// Accept one client and consume its CONNECT packet
async fn accept_connect(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(n > 0, "client closed before CONNECT");
    assert_eq!(buf[0], 0x10, "first packet should be CONNECT");
    stream
}

/// Read until `needle` shows up in the client's bytes; false on EOF
async fn read_until_contains(stream: &mut TcpStream, needle: &[u8]) -> bool {
    let mut seen = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            return false;
        }
        seen.extend_from_slice(&buf[..n]);
        if seen.windows(needle.len()).any(|window| window == needle) {
            return true;
        }
    }
}

async fn wait_for_state(
    connector: &MqttConnector,
    predicate: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    let mut states = connector.state_changes();
    let state = tokio::time::timeout(STATE_TIMEOUT, states.wait_for(predicate))
        .await
        .expect("state change within timeout")
        .expect("connector still alive");
    state.clone()
}

#[tokio::test]
async fn test_refused_credentials_move_to_failed() {
    // Arrange: every CONNECT is answered with NotAuthorized
    let (listener, port) = listener().await;
    let broker = tokio::spawn(async move {
        for _ in 0..2 {
            let mut stream = accept_connect(&listener).await;
            stream.write_all(&CONNACK_NOT_AUTHORIZED).await.unwrap();
        }
    });
    let config = BrokerConfig {
        username: Some("city".to_string()),
        password: Some("wrong".to_string()),
        ..broker_config(port)
    };
    let connector = MqttConnector::new("local", config);

    // Act
    connector.connect().await;
    let state = wait_for_state(&connector, ConnectionState::is_failed).await;

    // Assert: refused is final, no reconnect loop runs
    match state {
        ConnectionState::Failed(reason) => assert!(reason.contains("NotAuthorized"), "{reason}"),
        other => panic!("expected Failed, got {other:?}"),
    }
    assert!(!connector.wait_for_connection(Duration::from_millis(200)).await);
    assert!(connector.state().is_failed());

    // connect() restarts from Failed and is refused again
    connector.connect().await;
    assert_eq!(connector.state(), ConnectionState::Connecting);
    wait_for_state(&connector, ConnectionState::is_failed).await;

    tokio::time::timeout(STATE_TIMEOUT, broker)
        .await
        .expect("broker script finished")
        .unwrap();
    connector.disconnect().await;
    assert_eq!(connector.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_lost_link_reconnects_and_resubscribes() {
    // Arrange
    let (listener, port) = listener().await;
    let topic = "city/weather/state";
    let (resubscribed_tx, resubscribed_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let broker = tokio::spawn(async move {
        // First session: accept, wait for the SUBSCRIBE, then cut the link
        let mut first = accept_connect(&listener).await;
        first.write_all(&CONNACK_ACCEPTED).await.unwrap();
        assert!(read_until_contains(&mut first, topic.as_bytes()).await);
        drop(first);

        // Second session: the filter must be subscribed again unprompted
        let mut second = accept_connect(&listener).await;
        second.write_all(&CONNACK_ACCEPTED).await.unwrap();
        let resubscribed = read_until_contains(&mut second, topic.as_bytes()).await;
        let _ = resubscribed_tx.send(resubscribed);

        // Keep the session open until the test has looked at the state
        let _ = release_rx.await;
    });

    let connector = MqttConnector::new("local", broker_config(port))
        .with_reconnect_config(fast_reconnect())
        .unwrap();
    connector.connect().await;
    assert!(connector.wait_for_connection(STATE_TIMEOUT).await);

    // Act
    connector.subscribe(topic, QoS::AtLeastOnce).await.unwrap();
    let resubscribed = tokio::time::timeout(STATE_TIMEOUT, resubscribed_rx)
        .await
        .expect("second session within timeout")
        .unwrap();

    // Assert: a second ConnAck was handled and the filter re-issued on it
    assert!(resubscribed, "SUBSCRIBE should be re-sent after reconnect");
    assert!(connector.wait_for_connection(STATE_TIMEOUT).await);
    assert_eq!(connector.health_metrics().reconnect_count, 1);
    assert_eq!(connector.subscriptions(), vec![topic.to_string()]);

    let _ = release_tx.send(());
    connector.disconnect().await;
    broker.await.unwrap();
}

#[tokio::test]
async fn test_broker_packet_size_limit_applies_to_publish() {
    // Arrange: broker announces a 64 byte Maximum Packet Size
    let (listener, port) = listener().await;
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let broker = tokio::spawn(async move {
        let mut stream = accept_connect(&listener).await;
        stream.write_all(&CONNACK_MAX_PACKET_64).await.unwrap();
        let _ = release_rx.await;
    });

    let connector = MqttConnector::new("local", broker_config(port));
    connector.connect().await;
    assert!(connector.wait_for_connection(STATE_TIMEOUT).await);

    // Act: "test/echo" costs 14 bytes of framing at QoS 0
    assert_eq!(connector.max_packet_size(), 64);
    let fits = connector
        .publish("test/echo", vec![b'x'; 50], QoS::AtMostOnce, false)
        .await;
    let too_big = connector
        .publish("test/echo", vec![b'x'; 51], QoS::AtMostOnce, false)
        .await;

    // Assert
    assert!(fits.is_ok(), "{fits:?}");
    assert!(matches!(
        too_big,
        Err(MqttError::PayloadTooLarge { size: 65, max: 64 })
    ));
    assert!(connector.is_connected());

    let _ = release_tx.send(());
    connector.disconnect().await;
    broker.await.unwrap();
}
