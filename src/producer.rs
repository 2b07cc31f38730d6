//! Publishing endpoint
//!
//! [`MqttProducer`] publishes [`AdapterMessage`]s through a sync client of the
//! shared connection. Destination names are resolved to topics through the
//! live client once and cached for the lifetime of the producer.

use crate::config::{qos, ProduceDestination, ProducerConfig};
use crate::connection::MqttConnection;
use crate::error::{ConnectorError, ConnectorResult};
use crate::message::{AdapterMessage, MessageCodec, RawCodec};
use crate::transport::{OutgoingMessage, SharedClient, TransportError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace, Instrument};

/// Destination name to topic, filled on first use
#[derive(Debug, Default)]
pub struct TopicCache {
    topics: DashMap<String, String>,
}

impl TopicCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached topic for `name`, resolving it through `client` on a miss
    pub fn resolve(&self, name: &str, client: &SharedClient) -> Result<String, TransportError> {
        if let Some(topic) = self.topics.get(name) {
            return Ok(topic.value().clone());
        }

        let topic = client.topic(name)?;
        trace!(destination = %name, topic = %topic, "Caching resolved topic");
        Ok(self
            .topics
            .entry(name.to_string())
            .or_insert(topic)
            .value()
            .clone())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.topics.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn clear(&self) {
        self.topics.clear();
    }
}

pub struct MqttProducer {
    connection: Arc<MqttConnection>,
    config: ProducerConfig,
    codec: Arc<dyn MessageCodec>,
    client: RwLock<Option<SharedClient>>,
    topics: TopicCache,
}

impl MqttProducer {
    pub fn new(connection: Arc<MqttConnection>, config: ProducerConfig) -> Self {
        Self {
            connection,
            config,
            codec: Arc::new(RawCodec),
            client: RwLock::new(None),
            topics: TopicCache::new(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicCache {
        &self.topics
    }

    pub fn client(&self) -> Option<SharedClient> {
        self.client.read().clone()
    }

    pub fn prepare(&self) -> ConnectorResult<()> {
        self.config.validate()?;
        Ok(())
    }

    /// Acquire and connect a client
    pub async fn init(&self) -> ConnectorResult<()> {
        self.prepare()?;
        if self.client().is_some() {
            return Ok(());
        }

        let client = self.connection.get_or_create_sync_client(None)?;
        client.set_time_to_wait(self.config.time_to_wait);
        *self.client.write() = Some(client.clone());

        self.connection.start_client(&client).await
    }

    pub async fn start(&self) -> ConnectorResult<()> {
        let client = self
            .client()
            .ok_or(ConnectorError::NotInitialized("producer"))?;
        self.connection.start_client(&client).await
    }

    pub async fn stop(&self) {
        if let Some(client) = self.client() {
            self.connection.stop_client(&client).await;
        }
    }

    pub async fn close(&self) {
        let client = self.client.write().take();
        if let Some(client) = client {
            self.connection.close_client(&client).await;
        }
        self.topics.clear();
    }

    /// Destination name for `message`
    pub fn destination_name(&self, message: &AdapterMessage) -> ConnectorResult<String> {
        match &self.config.destination {
            ProduceDestination::Configured(name) => Ok(name.clone()),
            ProduceDestination::Metadata {
                metadata_key,
                default,
            } => message
                .metadata_value(metadata_key)
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string)
                .or_else(|| default.clone())
                .ok_or_else(|| ConnectorError::Destination {
                    message_id: message.id,
                    reason: format!("metadata key '{metadata_key}' is not set"),
                }),
        }
    }

    /// Publish one message with the configured QoS and retained flag
    pub async fn produce(&self, message: &AdapterMessage) -> ConnectorResult<()> {
        let client = self
            .client()
            .ok_or(ConnectorError::NotInitialized("producer"))?;

        let name = self.destination_name(message)?;
        let topic = self
            .topics
            .resolve(&name, &client)
            .map_err(|source| ConnectorError::Publish {
                topic: name.clone(),
                source,
            })?;

        let payload = self.codec.encode(message)?;
        let outgoing = OutgoingMessage::new(payload)
            .with_qos(qos(self.config.qos)?)
            .with_retained(self.config.retained);

        client
            .publish(&topic, outgoing)
            .instrument(crate::mqtt_span!("publish", topic = %topic, message_id = %message.id))
            .await
            .map_err(|source| ConnectorError::Publish {
                topic: topic.clone(),
                source,
            })?;

        debug!(message_id = %message.id, topic = %topic, "Message published");
        Ok(())
    }
}
