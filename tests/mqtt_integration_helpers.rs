//! MQTT Integration Test Helpers
//!
//! Provides helper utilities for integration tests with MQTT broker.
//! Assumes an MQTT broker is running at localhost:1883.

use mqtt_connector::config::ConnectionConfig;
use mqtt_connector::message::AdapterMessage;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// MQTT broker URL - expected at localhost:1883
pub const MQTT_BROKER_URL: &str = "tcp://localhost:1883";

/// Connection config pointing at the local broker, persisting under `root`
pub fn connection_config(root: &std::path::Path) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(MQTT_BROKER_URL).with_unique_id("it");
    config.connection_timeout = Some(Duration::from_secs(5));
    config.persistence_dir = Some(root.to_path_buf());
    config
}

/// Topic no other test run will have touched
pub fn unique_topic(prefix: &str) -> String {
    format!("mqtt-connector-it/{prefix}/{}", Uuid::new_v4().simple())
}

/// Collect whatever arrives within `window`
pub async fn drain(receiver: &mut mpsc::Receiver<AdapterMessage>, window: Duration) -> Vec<AdapterMessage> {
    let mut received = Vec::new();
    while let Ok(Some(message)) = timeout(window, receiver.recv()).await {
        received.push(message);
    }
    received
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_uses_localhost() {
        let config = connection_config(std::path::Path::new("/tmp"));
        assert_eq!(config.server_uri, "tcp://localhost:1883");
        assert_eq!(config.connection_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_unique_topics_differ() {
        assert_ne!(unique_topic("a"), unique_topic("a"));
    }
}
