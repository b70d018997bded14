//! One connector per active broker profile

use super::connection::{ClientIdGenerator, MqttError};
use super::connector::MqttConnector;
use crate::config::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Independent connectors keyed by profile name, in active-profile order
///
/// Connectors share no state: each has its own event loop, subscriptions
/// and watcher registry.
#[derive(Debug)]
pub struct ConnectorSet {
    connectors: Vec<(String, Arc<MqttConnector>)>,
}

impl ConnectorSet {
    /// Build (but do not connect) one connector per active profile
    pub fn from_config(config: &AppConfig, generator: &dyn ClientIdGenerator) -> Self {
        let connectors = config
            .iter()
            .map(|(name, broker)| {
                let connector =
                    MqttConnector::with_client_id_generator(name, broker.clone(), generator);
                (name.to_string(), Arc::new(connector))
            })
            .collect();
        Self { connectors }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<MqttConnector>> {
        self.connectors
            .iter()
            .find(|(profile, _)| profile == name)
            .map(|(_, connector)| connector)
    }

    /// Like [`get`](Self::get), with an error naming the missing profile
    pub fn require(&self, name: &str) -> Result<&Arc<MqttConnector>, MqttError> {
        self.get(name)
            .ok_or_else(|| MqttError::UnknownProfile(name.to_string()))
    }

    /// Connector for the first active profile
    pub fn primary(&self) -> Option<&Arc<MqttConnector>> {
        self.connectors.first().map(|(_, connector)| connector)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.connectors.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<MqttConnector>)> {
        self.connectors
            .iter()
            .map(|(name, connector)| (name.as_str(), connector))
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub async fn connect_all(&self) {
        for (_, connector) in &self.connectors {
            connector.connect().await;
        }
        info!(profiles = self.connectors.len(), "Connecting all broker profiles");
    }

    /// Wait for every connector concurrently; one (name, connected) pair per profile
    pub async fn wait_for_all(&self, timeout: Duration) -> Vec<(String, bool)> {
        let waits = self.connectors.iter().map(|(name, connector)| {
            let name = name.clone();
            let connector = Arc::clone(connector);
            tokio::spawn(async move {
                let connected = connector.wait_for_connection(timeout).await;
                (name, connected)
            })
        });
        let handles: Vec<_> = waits.collect();

        let mut results = Vec::with_capacity(handles.len());
        for (handle, (name, _)) in handles.into_iter().zip(&self.connectors) {
            results.push(handle.await.unwrap_or_else(|_| (name.clone(), false)));
        }
        results
    }

    pub async fn disconnect_all(&self) {
        for (_, connector) in &self.connectors {
            connector.disconnect().await;
        }
    }
}
