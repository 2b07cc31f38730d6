//! Protocol client abstraction
//!
//! [`ProtocolClient`] is the seam between connection management and the MQTT
//! library. The pool and endpoints only ever talk to clients through this
//! trait, which keeps them testable against the mocks in
//! [`crate::testing::mocks`]. The production implementation lives in
//! [`mqtt`].

use crate::options::ConnectOptions;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;
pub mod persistence;

pub use persistence::FilePersistence;

/// Flavour of client held by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    /// Operations wait for broker acknowledgement, bounded by time-to-wait
    Sync,
    /// Operations return once queued; acknowledgements arrive as events
    Async,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientKind::Sync => write!(f, "sync"),
            ClientKind::Async => write!(f, "async"),
        }
    }
}

/// Message handed to a client for publishing
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retained: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// Message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub duplicate: bool,
}

/// Notifications raised by a client's connection
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// CONNACK received; `reconnect` is false for the first connect
    ConnectComplete { reconnect: bool, server_uri: String },
    ConnectionLost { cause: String },
    MessageArrived(IncomingMessage),
    DeliveryComplete { packet_id: u16 },
}

/// Receiving half is owned by whoever registered the sink
pub type EventSink = mpsc::UnboundedSender<ClientEvent>;

/// Shared handle to a pooled client
pub type SharedClient = Arc<dyn ProtocolClient>;

/// Protocol client operations used by the pool and endpoints
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn client_id(&self) -> &str;

    fn server_uri(&self) -> &str;

    fn kind(&self) -> ClientKind;

    fn is_connected(&self) -> bool;

    /// Connect using the given options; returns once the broker has accepted
    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError>;

    /// Graceful disconnect
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Drop the connection without the DISCONNECT handshake
    async fn disconnect_forcibly(&self) -> Result<(), TransportError>;

    /// Release resources; the client cannot be reused afterwards
    async fn close(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Resolve a destination name into a publishable topic
    fn topic(&self, name: &str) -> Result<String, TransportError>;

    /// Register or clear the receiver of [`ClientEvent`]s
    fn set_event_sink(&self, sink: Option<EventSink>);

    /// Bound for operations waiting on the broker; `None` waits indefinitely
    fn set_time_to_wait(&self, time_to_wait: Option<Duration>);
}

/// Creates protocol clients for the pool
pub trait ClientFactory: Send + Sync {
    /// Library-generated identity suffix
    fn generate_client_id(&self) -> String;

    fn create(
        &self,
        server_uri: &str,
        client_id: &str,
        kind: ClientKind,
        persistence: FilePersistence,
    ) -> Result<SharedClient, TransportError>;
}

/// Protocol client failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid server URI: {0}")]
    InvalidServerUri(String),
    #[error("Client {0} is not connected")]
    NotConnected(String),
    #[error("Client {0} is still connected")]
    StillConnected(String),
    #[error("Client {0} has been closed")]
    Closed(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
    #[error("Request rejected by client")]
    Request(#[source] rumqttc::ClientError),
    #[error("Broker rejected subscription to {0}")]
    SubscriptionRejected(String),
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),
    #[error("Connection ended before {0} was acknowledged")]
    AckDropped(&'static str),
}
