//! Configuration for shared MQTT connections and the endpoints that use them
//!
//! A configuration file holds one `[connection]` table plus optional
//! `[consumer]` and `[producer]` tables. Durations use humantime syntax
//! (`"30s"`, `"2m"`, `"0s"`).

use crate::password::PasswordError;
use crate::topic::{validate_topic_filter, validate_topic_name};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration file layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorConfig {
    pub connection: ConnectionConfig,
    pub consumer: Option<ConsumerConfig>,
    pub producer: Option<ProducerConfig>,
}

/// Broker connection settings, owned by one `MqttConnection`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Broker URI, e.g. `tcp://localhost:1883` or `ssl://broker:8883`
    #[serde(default)]
    pub server_uri: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Clear text or an encoded form understood by [`crate::password::decode`]
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Absent means the client library default; zero disables the timeout
    #[serde(default, with = "humantime_serde")]
    pub connection_timeout: Option<Duration>,
    /// Absent means the client library default; zero disables keep-alive
    #[serde(default, with = "humantime_serde")]
    pub keep_alive_interval: Option<Duration>,
    #[serde(default)]
    pub ssl_properties: KeyValuePairSet,
    #[serde(default)]
    pub last_will: Option<LastWillConfig>,
    /// Prefix for generated client identities
    #[serde(default)]
    pub unique_id: Option<String>,
    /// Root for per-client persistence directories
    #[serde(default)]
    pub persistence_dir: Option<PathBuf>,
}

fn default_clean_session() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_uri: String::new(),
            username: None,
            password: None,
            protocol_version: ProtocolVersion::default(),
            clean_session: default_clean_session(),
            connection_timeout: None,
            keep_alive_interval: None,
            ssl_properties: KeyValuePairSet::default(),
            last_will: None,
            unique_id: None,
            persistence_dir: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(server_uri: impl Into<String>) -> Self {
        Self {
            server_uri: server_uri.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_ssl_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ssl_properties.add(key, value);
        self
    }

    pub fn with_last_will(mut self, last_will: LastWillConfig) -> Self {
        self.last_will = Some(last_will);
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    /// Check the settings that can be verified without building options
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_uri.trim().is_empty() {
            return Err(ConfigError::MissingServerUri);
        }

        if let Some(last_will) = &self.last_will {
            last_will.validate()?;
        }

        Ok(())
    }
}

/// MQTT protocol version requested on connect
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProtocolVersion {
    #[serde(rename = "V3_1", alias = "3.1")]
    V3_1,
    #[serde(rename = "V3_1_1", alias = "3.1.1")]
    V3_1_1,
    #[default]
    #[serde(rename = "DEFAULT", alias = "Default", alias = "default")]
    Default,
}

/// Last will and testament published by the broker on abnormal disconnect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastWillConfig {
    pub topic: String,
    #[serde(default = "default_will_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retained: bool,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_payload_encoding")]
    pub payload_encoding: String,
}

fn default_will_qos() -> u8 {
    1
}

fn default_payload_encoding() -> String {
    "UTF-8".to_string()
}

impl LastWillConfig {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            qos: default_will_qos(),
            retained: false,
            payload: payload.into(),
            payload_encoding: default_payload_encoding(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_topic_name(&self.topic).map_err(|reason| ConfigError::InvalidTopic {
            topic: self.topic.clone(),
            reason,
        })?;
        qos(self.qos)?;
        Ok(())
    }
}

/// A single named string property
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: String,
}

/// Ordered set of name/value pairs keyed by name
///
/// Adding a key that is already present replaces its value in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct KeyValuePairSet {
    pairs: Vec<KeyValuePair>,
}

impl KeyValuePairSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|p| p.key == key) {
            Some(existing) => existing.value = value,
            None => self.pairs.push(KeyValuePair { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValuePair> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KeyValuePairSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = KeyValuePairSet::new();
        for (key, value) in iter {
            set.add(key, value);
        }
        set
    }
}

/// Subscriber endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    /// Topic filter; may contain wildcards
    pub topic: String,
    #[serde(default = "default_endpoint_qos")]
    pub qos: u8,
    /// Upper bound for blocking client operations
    #[serde(default, with = "humantime_serde")]
    pub time_to_wait: Option<Duration>,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            qos: default_endpoint_qos(),
            time_to_wait: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "consumer topic must not be blank".to_string(),
            ));
        }
        validate_topic_filter(&self.topic).map_err(|reason| ConfigError::InvalidTopic {
            topic: self.topic.clone(),
            reason,
        })?;
        qos(self.qos)?;
        Ok(())
    }
}

/// Publisher endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProducerConfig {
    pub destination: ProduceDestination,
    #[serde(default = "default_endpoint_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retained: bool,
    #[serde(default, with = "humantime_serde")]
    pub time_to_wait: Option<Duration>,
}

impl ProducerConfig {
    pub fn new(destination: ProduceDestination) -> Self {
        Self {
            destination,
            qos: default_endpoint_qos(),
            retained: false,
            time_to_wait: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.destination.validate()?;
        qos(self.qos)?;
        Ok(())
    }
}

fn default_endpoint_qos() -> u8 {
    1
}

/// Where a producer sends each message
///
/// Simple form: `destination = "topic/name"`.
/// Metadata form: `destination = { metadata_key = "target", default = "fallback" }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProduceDestination {
    Configured(String),
    Metadata {
        metadata_key: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl ProduceDestination {
    pub fn configured(name: impl Into<String>) -> Self {
        ProduceDestination::Configured(name.into())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let blank = match self {
            ProduceDestination::Configured(name) => name.trim().is_empty(),
            ProduceDestination::Metadata { metadata_key, .. } => metadata_key.trim().is_empty(),
        };
        if blank {
            return Err(ConfigError::InvalidConfig(
                "producer destination must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors; all are fatal before any network attempt
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Server URI must be configured")]
    MissingServerUri,
    #[error("Invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },
    #[error("Unsupported payload encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("Last will payload cannot be encoded as {0}")]
    UnencodablePayload(String),
    #[error("Could not decode password: {0}")]
    Password(#[from] PasswordError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convert a configured QoS level into the protocol value
pub fn qos(level: u8) -> Result<QoS, ConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::InvalidQos(other)),
    }
}

/// Numeric level of a protocol QoS value
pub fn qos_level(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

impl ConnectorConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConnectorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        if let Some(consumer) = &self.consumer {
            consumer.validate()?;
        }
        if let Some(producer) = &self.producer {
            producer.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[connection]
server_uri = "ssl://broker.example.com:8883"
username = "username"
password = "PW:cGFzc3dvcmQ="
protocol_version = "V3_1_1"
clean_session = false
connection_timeout = "10s"
keep_alive_interval = "0s"
unique_id = "pipeline-1"

[[connection.ssl_properties]]
key = "trustStore"
value = "/etc/mqtt/ca.pem"

[[connection.ssl_properties]]
key = "trustStorePassword"
value = "changeit"

[connection.last_will]
topic = "status/pipeline-1"
payload = "offline"
retained = true

[consumer]
topic = "sensors/+/temp"
qos = 2
time_to_wait = "5s"

[producer]
destination = "out/topic"
retained = true
"#;

        let config = ConnectorConfig::from_toml_str(toml_content).unwrap();
        let connection = &config.connection;

        assert_eq!(connection.server_uri, "ssl://broker.example.com:8883");
        assert_eq!(connection.protocol_version, ProtocolVersion::V3_1_1);
        assert!(!connection.clean_session);
        assert_eq!(connection.connection_timeout, Some(Duration::from_secs(10)));
        assert_eq!(connection.keep_alive_interval, Some(Duration::ZERO));
        assert_eq!(connection.ssl_properties.len(), 2);
        assert_eq!(
            connection.ssl_properties.get("trustStore"),
            Some("/etc/mqtt/ca.pem")
        );

        let will = connection.last_will.as_ref().unwrap();
        assert_eq!(will.qos, 1);
        assert!(will.retained);
        assert_eq!(will.payload_encoding, "UTF-8");

        let consumer = config.consumer.unwrap();
        assert_eq!(consumer.qos, 2);
        assert_eq!(consumer.time_to_wait, Some(Duration::from_secs(5)));

        let producer = config.producer.unwrap();
        assert_eq!(producer.destination, ProduceDestination::configured("out/topic"));
        assert_eq!(producer.qos, 1);
        assert!(producer.retained);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = ConnectorConfig::from_toml_str(
            r#"
[connection]
server_uri = "tcp://localhost:1883"
"#,
        )
        .unwrap();

        let connection = config.connection;
        assert!(connection.clean_session);
        assert_eq!(connection.protocol_version, ProtocolVersion::Default);
        assert!(connection.connection_timeout.is_none());
        assert!(connection.keep_alive_interval.is_none());
        assert!(connection.ssl_properties.is_empty());
        assert!(config.consumer.is_none());
        assert!(config.producer.is_none());
    }

    #[test]
    fn test_missing_server_uri() {
        let result = ConnectorConfig::from_toml_str("[connection]\nusername = \"u\"\n");
        assert!(matches!(result, Err(ConfigError::MissingServerUri)));
    }

    #[test]
    fn test_metadata_destination() {
        let config = ConnectorConfig::from_toml_str(
            r#"
[connection]
server_uri = "tcp://localhost:1883"

[producer]
destination = { metadata_key = "target", default = "fallback/topic" }
qos = 0
"#,
        )
        .unwrap();

        assert_eq!(
            config.producer.unwrap().destination,
            ProduceDestination::Metadata {
                metadata_key: "target".to_string(),
                default: Some("fallback/topic".to_string()),
            }
        );
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let result = ConnectorConfig::from_toml_str(
            r#"
[connection]
server_uri = "tcp://localhost:1883"

[consumer]
topic = "a/b"
qos = 3
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidQos(3))));
    }

    #[test]
    fn test_consumer_topic_filter_validated() {
        let consumer = ConsumerConfig::new("bad/#/filter");
        assert!(matches!(
            consumer.validate(),
            Err(ConfigError::InvalidTopic { .. })
        ));
        assert!(ConsumerConfig::new("  ").validate().is_err());
    }

    #[test]
    fn test_last_will_topic_cannot_contain_wildcards() {
        let config = ConnectionConfig::new("tcp://localhost:1883")
            .with_last_will(LastWillConfig::new("status/#", "gone"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTopic { .. })
        ));
    }

    #[test]
    fn test_key_value_pair_set_replaces_in_place() {
        let mut set: KeyValuePairSet = [("a", "1"), ("b", "2")].into_iter().collect();
        set.add("a", "3");

        let keys: Vec<&str> = set.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(set.get("a"), Some("3"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos(7).is_err());
        assert_eq!(qos_level(QoS::AtLeastOnce), 1);
    }
}
