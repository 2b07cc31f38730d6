//! Message envelope exchanged with the host pipeline
//!
//! Consumers decode arriving payloads into an [`AdapterMessage`] and hand it
//! to a [`MessageListener`]; producers encode an [`AdapterMessage`] back into
//! bytes before publishing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Metadata key holding the topic a message arrived on
pub const TOPIC_METADATA_KEY: &str = "mqtt.topic";
/// Metadata key holding the QoS a message arrived with
pub const QOS_METADATA_KEY: &str = "mqtt.qos";
/// Metadata key holding the retained flag of an arrived message
pub const RETAINED_METADATA_KEY: &str = "mqtt.retained";

/// Pipeline message: payload plus string metadata
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterMessage {
    pub id: Uuid,
    pub payload: Bytes,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl AdapterMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Payload conversion failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to decode message: {0}")]
    Decode(String),
    #[error("Failed to encode message: {0}")]
    Encode(String),
}

/// Converts between wire payloads and pipeline messages
pub trait MessageCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<AdapterMessage, CodecError>;
    fn encode(&self, message: &AdapterMessage) -> Result<Bytes, CodecError>;
}

/// Passes payload bytes through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl MessageCodec for RawCodec {
    fn decode(&self, payload: &[u8]) -> Result<AdapterMessage, CodecError> {
        Ok(AdapterMessage::new(Bytes::copy_from_slice(payload)))
    }

    fn encode(&self, message: &AdapterMessage) -> Result<Bytes, CodecError> {
        Ok(message.payload.clone())
    }
}

/// Receives messages decoded by a consumer
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: AdapterMessage) -> Result<(), String>;
}

/// Listener that forwards messages into a channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::Sender<AdapterMessage>,
}

impl ChannelListener {
    pub fn new(sender: mpsc::Sender<AdapterMessage>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl MessageListener for ChannelListener {
    async fn on_message(&self, message: AdapterMessage) -> Result<(), String> {
        self.sender
            .send(message)
            .await
            .map_err(|e| format!("Failed to forward message: {e}"))
    }
}
