//! MQTT integration test helpers
//!
//! Each test starts its own Mosquitto container through testcontainers, so
//! a Docker daemon must be reachable. The broker runs with the image's
//! no-auth config, listening on 1883 for anonymous clients.

#![allow(dead_code)]

use simulated_city::config::BrokerConfig;
use simulated_city::transport::mqtt::{FixedClientId, MqttConnector};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::clients::Cli;
use testcontainers::{Container, GenericImage, RunnableImage};
use uuid::Uuid;

pub const MOSQUITTO_IMAGE: &str = "eclipse-mosquitto";
pub const MOSQUITTO_TAG: &str = "2.0";
pub const MQTT_BROKER_PORT: u16 = 1883;

/// Broker start-up is absorbed by the connector's reconnect loop
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// One Mosquitto container, stopped when the harness is dropped
pub struct MqttTestHarness<'d> {
    _container: Container<'d, GenericImage>,
    port: u16,
}

impl<'d> MqttTestHarness<'d> {
    pub async fn new(docker: &'d Cli) -> Self {
        let image = GenericImage::new(MOSQUITTO_IMAGE, MOSQUITTO_TAG)
            .with_exposed_port(MQTT_BROKER_PORT);
        let args = vec![
            "mosquitto".to_string(),
            "-c".to_string(),
            "/mosquitto-no-auth.conf".to_string(),
        ];
        let container = docker.run(RunnableImage::from((image, args)));
        let port = container.get_host_port_ipv4(MQTT_BROKER_PORT);

        Self {
            _container: container,
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Profile for this broker with a test-specific client-id prefix
    pub fn mqtt_config(&self, prefix: &str) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            client_id_prefix: prefix.to_string(),
            keepalive_secs: 10,
            ..BrokerConfig::local()
        }
    }

    /// Connector that has already reached Connected
    pub async fn connected_connector(&self, prefix: &str) -> Arc<MqttConnector> {
        let suffix = Uuid::new_v4().simple().to_string();
        let connector = Arc::new(MqttConnector::with_client_id_generator(
            "local",
            self.mqtt_config(prefix),
            &FixedClientId(suffix[..8].to_string()),
        ));
        connector.connect().await;
        assert!(
            connector.wait_for_connection(CONNECT_TIMEOUT).await,
            "connector should reach Connected within {CONNECT_TIMEOUT:?}"
        );
        connector
    }
}

/// Topic no other test run will publish on
pub fn unique_topic(name: &str) -> String {
    format!("simulated-city-tests/{}/{name}", Uuid::new_v4().simple())
}
