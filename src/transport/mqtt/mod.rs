//! rumqttc-backed protocol client
//!
//! This module separates pure functions from I/O operations:
//!
//! - [`connection`] - Pure option building, URI parsing and backoff
//! - [`message_handler`] - Pure event routing and acknowledgement matching
//! - [`session_rules`] - Pure reconnection decisions
//! - [`client`] - Impure I/O: the client, its factory and the event loop driver
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_connector::config::ConnectionConfig;
//! use mqtt_connector::options::ConnectOptions;
//! use mqtt_connector::transport::mqtt::RumqttClientFactory;
//! use mqtt_connector::transport::{ClientFactory, ClientKind, FilePersistence};
//!
//! # tokio_test::block_on(async {
//! let config = ConnectionConfig::new("tcp://localhost:1883");
//! let options = ConnectOptions::build(&config)?;
//!
//! let factory = RumqttClientFactory::new();
//! let client_id = factory.generate_client_id();
//! let persistence = FilePersistence::new(FilePersistence::default_root(), &client_id, &config.server_uri);
//! let client = factory.create(&config.server_uri, &client_id, ClientKind::Sync, persistence)?;
//! client.connect(&options).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod session_rules;
pub mod message_handler;

pub use client::{RumqttClient, RumqttClientFactory};
pub use connection::{BrokerAddress, ConnectionState, ReconnectConfig};
pub use session_rules::{RetryDecision, SessionEvent, SessionRules};
pub use message_handler::{AckKind, AckTracker, EventRoute, MessageHandler};
