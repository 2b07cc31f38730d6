//! Connect options derived from connection configuration
//!
//! [`ConnectOptions`] is built once per connection and shared by every client
//! the connection creates. Building decodes secrets, maps TLS properties and
//! encodes the last will payload; any failure aborts the whole build so a
//! partially populated value is never handed out.

use crate::config::{qos, ConfigError, ConnectionConfig, LastWillConfig, ProtocolVersion};
use crate::password;
use crate::ssl::{create_ssl_context_properties, SslContextProperties};
use rumqttc::QoS;
use std::time::Duration;

/// Sentinel for "leave the client library default in place"
pub const NO_OVERRIDE: i64 = -1;

/// Last will ready to hand to the protocol client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

/// Immutable protocol-level connect options
#[derive(Clone, PartialEq)]
pub struct ConnectOptions {
    username: Option<String>,
    password: Option<String>,
    protocol_version: ProtocolVersion,
    clean_session: bool,
    connection_timeout_secs: i64,
    keep_alive_interval_secs: i64,
    ssl_properties: Option<SslContextProperties>,
    will: Option<WillMessage>,
    automatic_reconnect: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            protocol_version: ProtocolVersion::Default,
            clean_session: true,
            connection_timeout_secs: NO_OVERRIDE,
            keep_alive_interval_secs: NO_OVERRIDE,
            ssl_properties: None,
            will: None,
            automatic_reconnect: true,
        }
    }
}

impl ConnectOptions {
    /// Build options from configuration
    pub fn build(config: &ConnectionConfig) -> Result<Self, ConfigError> {
        let mut options = ConnectOptions::default();

        if let (Some(username), Some(secret)) = (non_blank(&config.username), non_blank(&config.password)) {
            options.username = Some(username.to_string());
            options.password = Some(password::decode(secret)?);
        }

        options.protocol_version = config.protocol_version;
        options.clean_session = config.clean_session;
        options.connection_timeout_secs = duration_to_seconds(config.connection_timeout);
        options.keep_alive_interval_secs = duration_to_seconds(config.keep_alive_interval);

        let ssl_properties = create_ssl_context_properties(&config.ssl_properties)?;
        if !ssl_properties.is_empty() {
            options.ssl_properties = Some(ssl_properties);
        }

        if let Some(last_will) = &config.last_will {
            options.will = Some(will_message(last_will)?);
        }

        options.automatic_reconnect = true;
        Ok(options)
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Seconds, or [`NO_OVERRIDE`]
    pub fn connection_timeout_secs(&self) -> i64 {
        self.connection_timeout_secs
    }

    /// Seconds, or [`NO_OVERRIDE`]
    pub fn keep_alive_interval_secs(&self) -> i64 {
        self.keep_alive_interval_secs
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        seconds_to_duration(self.connection_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        seconds_to_duration(self.keep_alive_interval_secs)
    }

    pub fn ssl_properties(&self) -> Option<&SslContextProperties> {
        self.ssl_properties.as_ref()
    }

    pub fn will(&self) -> Option<&WillMessage> {
        self.will.as_ref()
    }

    pub fn automatic_reconnect(&self) -> bool {
        self.automatic_reconnect
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("protocol_version", &self.protocol_version)
            .field("clean_session", &self.clean_session)
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .field("keep_alive_interval_secs", &self.keep_alive_interval_secs)
            .field("ssl_properties", &self.ssl_properties)
            .field("will", &self.will)
            .field("automatic_reconnect", &self.automatic_reconnect)
            .finish()
    }
}

/// Whole seconds of an optional duration; absent maps to [`NO_OVERRIDE`]
pub fn duration_to_seconds(duration: Option<Duration>) -> i64 {
    match duration {
        Some(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        None => NO_OVERRIDE,
    }
}

fn seconds_to_duration(seconds: i64) -> Option<Duration> {
    u64::try_from(seconds).ok().map(Duration::from_secs)
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn will_message(config: &LastWillConfig) -> Result<WillMessage, ConfigError> {
    config.validate()?;
    Ok(WillMessage {
        topic: config.topic.clone(),
        payload: encode_payload(&config.payload, &config.payload_encoding)?,
        qos: qos(config.qos)?,
        retained: config.retained,
    })
}

/// Encode text with a named character set
pub fn encode_payload(payload: &str, encoding: &str) -> Result<Vec<u8>, ConfigError> {
    let normalized = encoding.trim().to_ascii_uppercase().replace('_', "-");
    match normalized.as_str() {
        "UTF-8" | "UTF8" => Ok(payload.as_bytes().to_vec()),
        "US-ASCII" | "ASCII" => {
            if payload.is_ascii() {
                Ok(payload.as_bytes().to_vec())
            } else {
                Err(ConfigError::UnencodablePayload(encoding.to_string()))
            }
        }
        "ISO-8859-1" | "ISO8859-1" | "LATIN1" | "LATIN-1" => payload
            .chars()
            .map(|c| u8::try_from(u32::from(c)))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| ConfigError::UnencodablePayload(encoding.to_string())),
        "UTF-16" => {
            let mut bytes = vec![0xFE, 0xFF];
            bytes.extend(payload.encode_utf16().flat_map(u16::to_be_bytes));
            Ok(bytes)
        }
        "UTF-16BE" => Ok(payload.encode_utf16().flat_map(u16::to_be_bytes).collect()),
        "UTF-16LE" => Ok(payload.encode_utf16().flat_map(u16::to_le_bytes).collect()),
        _ => Err(ConfigError::UnsupportedEncoding(encoding.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssl::keys;
    use proptest::prelude::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("tcp://localhost:1883")
    }

    #[test]
    fn test_credentials_are_exposed() {
        let options = ConnectOptions::build(&config().with_credentials("username", "password")).unwrap();

        assert_eq!(options.username(), Some("username"));
        assert_eq!(options.password(), Some("password"));
    }

    #[test]
    fn test_encoded_password_is_decoded() {
        let options =
            ConnectOptions::build(&config().with_credentials("username", "PW:cGFzc3dvcmQ=")).unwrap();
        assert_eq!(options.password(), Some("password"));
    }

    #[test]
    fn test_credentials_need_both_parts() {
        let mut cfg = config();
        cfg.username = Some("username".to_string());
        cfg.password = Some("  ".to_string());

        let options = ConnectOptions::build(&cfg).unwrap();

        assert!(options.username().is_none());
        assert!(options.password().is_none());
    }

    #[test]
    fn test_malformed_password_fails_build() {
        let result = ConnectOptions::build(&config().with_credentials("username", "PW:***"));
        assert!(matches!(result, Err(ConfigError::Password(_))));
    }

    #[test]
    fn test_unset_durations_do_not_override() {
        let options = ConnectOptions::build(&config()).unwrap();

        assert_eq!(options.connection_timeout_secs(), NO_OVERRIDE);
        assert_eq!(options.keep_alive_interval_secs(), NO_OVERRIDE);
        assert!(options.connection_timeout().is_none());
        assert!(options.keep_alive_interval().is_none());
    }

    #[test]
    fn test_zero_durations_are_explicit() {
        let mut cfg = config();
        cfg.connection_timeout = Some(Duration::ZERO);
        cfg.keep_alive_interval = Some(Duration::from_millis(90_500));

        let options = ConnectOptions::build(&cfg).unwrap();

        assert_eq!(options.connection_timeout_secs(), 0);
        assert_eq!(options.connection_timeout(), Some(Duration::ZERO));
        assert_eq!(options.keep_alive_interval_secs(), 90);
    }

    #[test]
    fn test_ssl_properties_only_when_configured() {
        let options = ConnectOptions::build(&config()).unwrap();
        assert!(options.ssl_properties().is_none());

        let options = ConnectOptions::build(
            &config()
                .with_ssl_property("trustStore", "/etc/ca.pem")
                .with_ssl_property("trustStorePassword", "changeit"),
        )
        .unwrap();
        let ssl = options.ssl_properties().unwrap();
        assert_eq!(ssl.len(), 2);
        assert_eq!(ssl.get(keys::TRUST_STORE), Some("/etc/ca.pem"));
    }

    #[test]
    fn test_unrecognised_ssl_names_attach_nothing() {
        let options = ConnectOptions::build(
            &config()
                .with_ssl_property("frobnicate", "x")
                .with_ssl_property("cipherOfTheDay", "rot13"),
        )
        .unwrap();
        assert!(options.ssl_properties().is_none());
    }

    #[test]
    fn test_protocol_and_session_always_applied() {
        let mut cfg = config();
        cfg.protocol_version = ProtocolVersion::V3_1_1;
        cfg.clean_session = false;

        let options = ConnectOptions::build(&cfg).unwrap();

        assert_eq!(options.protocol_version(), ProtocolVersion::V3_1_1);
        assert!(!options.clean_session());
        assert!(options.automatic_reconnect());
    }

    #[test]
    fn test_last_will_encoded() {
        let mut will = LastWillConfig::new("status/adapter", "gone");
        will.qos = 2;
        will.retained = true;
        will.payload_encoding = "utf-16le".to_string();

        let options = ConnectOptions::build(&config().with_last_will(will)).unwrap();
        let will = options.will().unwrap();

        assert_eq!(will.topic, "status/adapter");
        assert_eq!(will.payload, vec![b'g', 0, b'o', 0, b'n', 0, b'e', 0]);
        assert_eq!(will.qos, QoS::ExactlyOnce);
        assert!(will.retained);
    }

    #[test]
    fn test_unknown_will_encoding_fails_build() {
        let mut will = LastWillConfig::new("status/adapter", "gone");
        will.payload_encoding = "EBCDIC-XYZ".to_string();

        let result = ConnectOptions::build(&config().with_last_will(will));
        assert!(matches!(result, Err(ConfigError::UnsupportedEncoding(_))));
    }

    #[test]
    fn test_charsets() {
        assert_eq!(encode_payload("é", "ISO-8859-1").unwrap(), vec![0xE9]);
        assert_eq!(encode_payload("é", "UTF-8").unwrap(), vec![0xC3, 0xA9]);
        assert_eq!(encode_payload("A", "UTF-16").unwrap(), vec![0xFE, 0xFF, 0x00, 0x41]);
        assert_eq!(encode_payload("A", "UTF-16BE").unwrap(), vec![0x00, 0x41]);
        assert!(matches!(
            encode_payload("é", "US-ASCII"),
            Err(ConfigError::UnencodablePayload(_))
        ));
        assert!(encode_payload("€", "latin1").is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let options = ConnectOptions::build(&config().with_credentials("username", "hunter2")).unwrap();
        assert!(!format!("{options:?}").contains("hunter2"));
    }

    proptest! {
        #[test]
        fn test_latin1_is_one_byte_per_char(s in "[\\x00-\\xff]{0,64}") {
            let bytes = encode_payload(&s, "ISO-8859-1").unwrap();
            prop_assert_eq!(bytes.len(), s.chars().count());
        }
    }
}
