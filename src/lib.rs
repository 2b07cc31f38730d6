//! MQTT Connector - shared broker connections for pipeline endpoints
//!
//! This crate lets many publishing and subscribing endpoints in one process
//! share a configured MQTT connection.
//!
//! # Overview
//!
//! - [`ssl`] maps generic SSL property names onto the TLS settings of the
//!   protocol client
//! - [`options`] builds immutable connect options (credentials, last will,
//!   timeouts, TLS) once per connection
//! - [`pool`] keeps sync and async protocol clients keyed by client identity
//! - [`connection`] drives the shared connection lifecycle
//! - [`consumer`] and [`producer`] are the endpoints; consumers resubscribe
//!   after reconnects and producers cache resolved topics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_connector::config::{ConnectionConfig, ProduceDestination, ProducerConfig};
//! use mqtt_connector::{AdapterMessage, MqttConnection, MqttProducer};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let connection = Arc::new(MqttConnection::new(ConnectionConfig::new("tcp://localhost:1883")));
//! connection.init()?;
//! connection.start()?;
//!
//! let producer = MqttProducer::new(
//!     connection.clone(),
//!     ProducerConfig::new(ProduceDestination::configured("sensors/temperature")),
//! );
//! producer.init().await?;
//! producer.produce(&AdapterMessage::new("21.5")).await?;
//!
//! producer.close().await;
//! connection.close().await;
//! # Ok::<(), mqtt_connector::ConnectorError>(())
//! # });
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod observability;
pub mod options;
pub mod password;
pub mod pool;
pub mod producer;
pub mod ssl;
pub mod testing;
pub mod topic;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig, ConnectorConfig};
pub use connection::{LifecycleState, MqttConnection};
pub use consumer::MqttConsumer;
pub use error::{ConnectorError, ConnectorResult};
pub use message::{AdapterMessage, MessageCodec, MessageListener};
pub use options::ConnectOptions;
pub use pool::ClientPool;
pub use producer::{MqttProducer, TopicCache};
pub use transport::{ClientEvent, ClientKind, ProtocolClient};
