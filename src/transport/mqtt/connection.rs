//! Pure connection configuration for the rumqttc client
//!
//! This module contains pure functions that turn a server URI and
//! [`ConnectOptions`] into rumqttc `MqttOptions`, plus the connection state
//! and reconnect backoff used by the event loop driver.

use crate::config::ProtocolVersion;
use crate::options::ConnectOptions;
use crate::ssl::{keys, SslContextProperties};
use crate::transport::TransportError;
use rumqttc::{LastWill, MqttOptions, TlsConfiguration, Transport};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Connect timeout used when the options leave it to the library
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection state for one client session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for CONNACK
    Connecting,
    /// Broker accepted the connection
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Waiting before reconnect attempt n
    Reconnecting(u32),
    /// Reconnection gave up or was not allowed
    PermanentlyDisconnected(String),
}

/// Reconnection backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delay per attempt in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            // 1s doubling up to the 128s ceiling
            backoff_pattern: vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000],
            sustained_delay: 128_000,
        }
    }
}

impl ReconnectConfig {
    /// Total delay across all attempts; None if unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Delay before the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Broker address parsed from a server URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `tcp://`, `mqtt://`, `ssl://`, `mqtts://` or `tls://` URIs
pub fn parse_server_uri(server_uri: &str) -> Result<BrokerAddress, TransportError> {
    let url = Url::parse(server_uri.trim())
        .map_err(|_| TransportError::InvalidServerUri(server_uri.to_string()))?;

    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "mqtts" | "tls" => true,
        _ => return Err(TransportError::InvalidServerUri(server_uri.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidServerUri(server_uri.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Effective connect timeout; zero disables it
pub fn connection_timeout(options: &ConnectOptions) -> Option<Duration> {
    match options.connection_timeout() {
        None => Some(DEFAULT_CONNECTION_TIMEOUT),
        Some(timeout) if timeout.is_zero() => None,
        Some(timeout) => Some(timeout),
    }
}

/// Pure function to build rumqttc options for one client
pub fn configure_mqtt_options(
    client_id: &str,
    address: &BrokerAddress,
    options: &ConnectOptions,
) -> Result<MqttOptions, TransportError> {
    let mut mqtt_options = MqttOptions::new(client_id, address.host.clone(), address.port);

    if let (Some(username), Some(password)) = (options.username(), options.password()) {
        mqtt_options.set_credentials(username, password);
    }

    if options.protocol_version() == ProtocolVersion::V3_1 {
        warn!(
            client_id = %client_id,
            "MQTT 3.1 requested; connecting with 3.1.1"
        );
    }

    mqtt_options.set_clean_session(options.clean_session());

    if let Some(keep_alive) = options.keep_alive_interval() {
        mqtt_options.set_keep_alive(keep_alive);
    }

    if let Some(will) = options.will() {
        mqtt_options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.clone(),
            will.qos,
            will.retained,
        ));
    }

    if address.tls {
        mqtt_options.set_transport(tls_transport(options.ssl_properties())?);
    } else if options.ssl_properties().is_some() {
        debug!(
            client_id = %client_id,
            "SSL properties ignored for plain TCP connection"
        );
    }

    Ok(mqtt_options)
}

/// Build a TLS transport from native SSL properties
///
/// `ssl.trustStore` names a PEM CA bundle and `ssl.keyStore` a PEM file
/// holding the client certificate chain and private key. Without a trust
/// store the platform roots are used.
pub fn tls_transport(properties: Option<&SslContextProperties>) -> Result<Transport, TransportError> {
    let Some(properties) = properties else {
        return Ok(Transport::tls_with_default_config());
    };

    for key in [keys::TRUST_STORE_TYPE, keys::KEY_STORE_TYPE] {
        if let Some(store_type) = properties.get(key) {
            if !store_type.eq_ignore_ascii_case("PEM") {
                return Err(TransportError::Tls(format!(
                    "{key}={store_type} is not supported, only PEM stores can be used"
                )));
            }
        }
    }

    for key in properties.keys() {
        if !matches!(
            key,
            keys::TRUST_STORE | keys::KEY_STORE | keys::TRUST_STORE_TYPE | keys::KEY_STORE_TYPE
        ) {
            debug!("SSL property {} is not used by the TLS transport", key);
        }
    }

    let Some(trust_store) = properties.get(keys::TRUST_STORE) else {
        if properties.contains_key(keys::KEY_STORE) {
            warn!("Key store configured without a trust store; client certificate not presented");
        }
        return Ok(Transport::tls_with_default_config());
    };

    let ca = read_pem(trust_store)?;
    let client_auth = match properties.get(keys::KEY_STORE) {
        Some(key_store) => {
            let pem = read_pem(key_store)?;
            Some((pem.clone(), pem))
        }
        None => None,
    };

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

fn read_pem(path: &str) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|e| TransportError::Tls(format!("Cannot read {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, LastWillConfig};
    use std::io::Write;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.sustained_delay, 128_000);
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let config = ReconnectConfig::default();

        assert_eq!(config.calculate_backoff_delay(1), 1_000);
        assert_eq!(config.calculate_backoff_delay(2), 2_000);
        assert_eq!(config.calculate_backoff_delay(7), 64_000);
        assert_eq!(config.calculate_backoff_delay(8), 128_000);
        assert_eq!(config.calculate_backoff_delay(100), 128_000);
    }

    #[test]
    fn test_calculate_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            ..ReconnectConfig::default()
        };
        assert_eq!(config.calculate_max_total_time(), Some(7_000));
        assert_eq!(ReconnectConfig::default().calculate_max_total_time(), None);
    }

    #[test]
    fn test_parse_server_uri() {
        let plain = parse_server_uri("tcp://localhost").unwrap();
        assert_eq!(plain.port, 1883);
        assert!(!plain.tls);

        let secure = parse_server_uri("ssl://broker.example.com").unwrap();
        assert_eq!(secure.host, "broker.example.com");
        assert_eq!(secure.port, 8883);
        assert!(secure.tls);

        let explicit = parse_server_uri("mqtt://10.0.0.1:2883").unwrap();
        assert_eq!(explicit.port, 2883);
    }

    #[test]
    fn test_invalid_server_uri() {
        assert!(matches!(
            parse_server_uri("invalid-url"),
            Err(TransportError::InvalidServerUri(_))
        ));
        assert!(parse_server_uri("http://localhost:1883").is_err());
    }

    #[test]
    fn test_connection_timeout_defaults() {
        let mut config = ConnectionConfig::new("tcp://localhost:1883");
        let options = ConnectOptions::build(&config).unwrap();
        assert_eq!(connection_timeout(&options), Some(DEFAULT_CONNECTION_TIMEOUT));

        config.connection_timeout = Some(Duration::ZERO);
        let options = ConnectOptions::build(&config).unwrap();
        assert_eq!(connection_timeout(&options), None);

        config.connection_timeout = Some(Duration::from_secs(5));
        let options = ConnectOptions::build(&config).unwrap();
        assert_eq!(connection_timeout(&options), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let mut config = ConnectionConfig::new("tcp://localhost:1883")
            .with_credentials("username", "password")
            .with_last_will(LastWillConfig::new("status/client", "offline"));
        config.keep_alive_interval = Some(Duration::from_secs(20));
        config.clean_session = false;
        let options = ConnectOptions::build(&config).unwrap();
        let address = parse_server_uri(&config.server_uri).unwrap();

        let mqtt_options = configure_mqtt_options("owner-1", &address, &options).unwrap();

        assert_eq!(mqtt_options.client_id(), "owner-1");
        assert_eq!(mqtt_options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(20));
        assert!(!mqtt_options.clean_session());
        assert!(mqtt_options.last_will().is_some());
    }

    #[test]
    fn test_tls_rejects_non_pem_stores() {
        let mut properties = SslContextProperties::new();
        properties.set(keys::TRUST_STORE_TYPE, "JKS");

        assert!(matches!(
            tls_transport(Some(&properties)),
            Err(TransportError::Tls(_))
        ));
    }

    #[test]
    fn test_tls_missing_trust_store_file() {
        let mut properties = SslContextProperties::new();
        properties.set(keys::TRUST_STORE, "/definitely/not/here.pem");

        assert!(matches!(
            tls_transport(Some(&properties)),
            Err(TransportError::Tls(_))
        ));
    }

    #[test]
    fn test_tls_reads_trust_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        let mut properties = SslContextProperties::new();
        properties.set(keys::TRUST_STORE, file.path().to_string_lossy().to_string());
        properties.set(keys::TRUST_STORE_PASSWORD, "ignored");

        assert!(tls_transport(Some(&properties)).is_ok());
    }
}
