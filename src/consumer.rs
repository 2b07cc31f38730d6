//! Subscribing endpoint
//!
//! [`MqttConsumer`] binds one topic filter to a [`MessageListener`]. It takes
//! a sync client from the shared connection, registers itself as the client's
//! event sink and re-issues its subscription every time the client reports a
//! reconnect. Clean sessions lose their subscriptions on reconnect, so this is
//! what keeps a long-running consumer receiving.

use crate::config::{qos, qos_level, ConsumerConfig};
use crate::connection::MqttConnection;
use crate::error::{ConnectorError, ConnectorResult};
use crate::message::{
    MessageCodec, MessageListener, RawCodec, QOS_METADATA_KEY, RETAINED_METADATA_KEY,
    TOPIC_METADATA_KEY,
};
use crate::transport::{ClientEvent, IncomingMessage, SharedClient};
use parking_lot::{Mutex, RwLock};
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Reacts to the events of the consumer's client
struct Subscriber {
    topic: String,
    qos: QoS,
    listener: Arc<dyn MessageListener>,
    codec: Arc<dyn MessageCodec>,
    client: RwLock<Option<SharedClient>>,
}

impl Subscriber {
    fn client(&self) -> Option<SharedClient> {
        self.client.read().clone()
    }

    async fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::ConnectComplete {
                reconnect: true,
                server_uri,
            } => {
                info!(server_uri = %server_uri, topic = %self.topic, "Reconnected, resubscribing");
                self.resubscribe().await;
            }
            ClientEvent::ConnectComplete { server_uri, .. } => {
                debug!(server_uri = %server_uri, "Connected");
            }
            ClientEvent::ConnectionLost { cause } => {
                warn!(topic = %self.topic, cause = %cause, "Connection lost");
            }
            ClientEvent::MessageArrived(message) => self.deliver(message).await,
            ClientEvent::DeliveryComplete { packet_id } => {
                trace!(packet_id, "Delivery complete");
            }
        }
    }

    async fn resubscribe(&self) {
        let Some(client) = self.client() else {
            return;
        };

        if let Err(e) = self.subscribe(&client).await {
            error!(client_id = %client.client_id(), error = %e, "Could not resubscribe after reconnect");
        }
    }

    async fn subscribe(&self, client: &SharedClient) -> ConnectorResult<()> {
        client
            .subscribe(&self.topic, self.qos)
            .instrument(crate::mqtt_span!("subscribe", topic = %self.topic))
            .await
            .map_err(|e| ConnectorError::subscribe(&self.topic, e))
    }

    async fn unsubscribe(&self, client: &SharedClient) -> ConnectorResult<()> {
        client
            .unsubscribe(&self.topic)
            .instrument(crate::mqtt_span!("unsubscribe", topic = %self.topic))
            .await
            .map_err(|e| ConnectorError::unsubscribe(&self.topic, e))
    }

    async fn deliver(&self, incoming: IncomingMessage) {
        let message = match self.codec.decode(&incoming.payload) {
            Ok(message) => message,
            Err(e) => {
                error!(topic = %incoming.topic, error = %e, "Could not decode message");
                return;
            }
        };

        let message = message
            .with_metadata(TOPIC_METADATA_KEY, incoming.topic.as_str())
            .with_metadata(QOS_METADATA_KEY, qos_level(incoming.qos).to_string())
            .with_metadata(RETAINED_METADATA_KEY, incoming.retained.to_string());
        let message_id = message.id;

        trace!(message_id = %message_id, topic = %incoming.topic, "Message arrived");
        if let Err(e) = self.listener.on_message(message).await {
            error!(message_id = %message_id, error = %e, "Listener failed to handle message");
        }
    }
}

pub struct MqttConsumer {
    connection: Arc<MqttConnection>,
    config: ConsumerConfig,
    subscriber: Arc<Subscriber>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConsumer {
    pub fn new(
        connection: Arc<MqttConnection>,
        config: ConsumerConfig,
        listener: Arc<dyn MessageListener>,
    ) -> Self {
        let subscriber = Subscriber {
            topic: config.topic.clone(),
            qos: qos(config.qos).unwrap_or(QoS::AtLeastOnce),
            listener,
            codec: Arc::new(RawCodec),
            client: RwLock::new(None),
        };

        Self {
            connection,
            config,
            subscriber: Arc::new(subscriber),
            dispatcher: Mutex::new(None),
        }
    }

    /// Replace the payload codec; must be called before `init`
    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        if let Some(subscriber) = Arc::get_mut(&mut self.subscriber) {
            subscriber.codec = codec;
        }
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Client currently held by this consumer
    pub fn client(&self) -> Option<SharedClient> {
        self.subscriber.client()
    }

    pub fn prepare(&self) -> ConnectorResult<()> {
        self.config.validate()?;
        Ok(())
    }

    /// Acquire a client, route its events to this consumer and connect it
    pub async fn init(&self) -> ConnectorResult<()> {
        self.prepare()?;
        if self.client().is_some() {
            return Ok(());
        }

        let client = self.connection.get_or_create_sync_client(None)?;
        let (sink, events) = mpsc::unbounded_channel();
        client.set_event_sink(Some(sink));
        client.set_time_to_wait(self.config.time_to_wait);
        *self.subscriber.client.write() = Some(client.clone());
        self.spawn_dispatcher(events);

        self.connection.start_client(&client).await
    }

    fn spawn_dispatcher(&self, mut events: mpsc::UnboundedReceiver<ClientEvent>) {
        let subscriber = self.subscriber.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                subscriber.handle_event(event).await;
            }
            trace!(topic = %subscriber.topic, "Event sink closed, dispatcher exiting");
        });

        if let Some(previous) = self.dispatcher.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Connect if needed and subscribe to the configured topic
    ///
    /// A rejected subscription is logged; the next reconnect retries it.
    pub async fn start(&self) -> ConnectorResult<()> {
        let client = self
            .client()
            .ok_or(ConnectorError::NotInitialized("consumer"))?;

        self.connection.start_client(&client).await?;
        match self.subscriber.subscribe(&client).await {
            Ok(()) => {
                debug!(client_id = %client.client_id(), topic = %self.subscriber.topic, "Subscribed");
            }
            Err(e) => {
                error!(client_id = %client.client_id(), error = %e, "Could not subscribe");
            }
        }
        Ok(())
    }

    /// Unsubscribe and disconnect; failures are logged
    pub async fn stop(&self) {
        let Some(client) = self.client() else {
            return;
        };

        if let Err(e) = self.subscriber.unsubscribe(&client).await {
            error!(client_id = %client.client_id(), error = %e, "Could not unsubscribe");
        }
        self.connection.stop_client(&client).await;
    }

    /// Release the client back through the connection
    pub async fn close(&self) {
        let client = self.subscriber.client.write().take();

        if let Some(client) = client {
            if client.is_connected() {
                if let Err(e) = self.subscriber.unsubscribe(&client).await {
                    error!(client_id = %client.client_id(), error = %e, "Could not unsubscribe");
                }
            }
            self.connection.close_client(&client).await;
        }

        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }

    /// Handle one client event as the dispatcher would
    pub async fn handle_event(&self, event: ClientEvent) {
        self.subscriber.handle_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::testing::mocks::{MockClientFactory, RecordingListener};
    use crate::transport::ProtocolClient;
    use bytes::Bytes;

    fn consumer(topic: &str) -> (MqttConsumer, Arc<MockClientFactory>, Arc<RecordingListener>) {
        let factory = Arc::new(MockClientFactory::new());
        let connection = Arc::new(MqttConnection::with_factory(
            ConnectionConfig::new("tcp://localhost:1883").with_unique_id("consumer"),
            factory.clone(),
        ));
        connection.init().unwrap();
        connection.start().unwrap();

        let listener = Arc::new(RecordingListener::new());
        let consumer = MqttConsumer::new(connection, ConsumerConfig::new(topic), listener.clone());
        (consumer, factory, listener)
    }

    #[test]
    fn test_prepare_rejects_blank_topic() {
        let (consumer, _, _) = consumer("  ");
        assert!(matches!(consumer.prepare(), Err(ConnectorError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_before_init() {
        let (consumer, _, _) = consumer("sensors/#");
        assert!(matches!(
            consumer.start().await,
            Err(ConnectorError::NotInitialized("consumer"))
        ));
    }

    #[tokio::test]
    async fn test_init_and_start_subscribe() {
        let (consumer, factory, _) = consumer("sensors/#");
        consumer.init().await.unwrap();
        consumer.start().await.unwrap();

        let client = factory.last().unwrap();
        assert!(client.has_event_sink());
        assert_eq!(client.connect_count(), 1);
        assert_eq!(client.subscriptions(), vec![("sensors/#".to_string(), QoS::AtLeastOnce)]);
    }

    #[tokio::test]
    async fn test_resubscribes_on_reconnect_only() {
        let (consumer, factory, _) = consumer("sensors/#");
        consumer.init().await.unwrap();
        consumer.start().await.unwrap();
        let client = factory.last().unwrap();

        consumer
            .handle_event(ClientEvent::ConnectComplete {
                reconnect: false,
                server_uri: "tcp://localhost:1883".to_string(),
            })
            .await;
        assert_eq!(client.subscriptions().len(), 1);

        consumer
            .handle_event(ClientEvent::ConnectComplete {
                reconnect: true,
                server_uri: "tcp://localhost:1883".to_string(),
            })
            .await;
        assert_eq!(client.subscriptions().len(), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_failure_is_swallowed() {
        let (consumer, factory, _) = consumer("sensors/#");
        consumer.init().await.unwrap();
        let client = factory.last().unwrap();
        client.fail_subscribe(true);

        consumer
            .handle_event(ClientEvent::ConnectComplete {
                reconnect: true,
                server_uri: "tcp://localhost:1883".to_string(),
            })
            .await;
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_subscription_does_not_fail_start() {
        let (consumer, factory, _) = consumer("sensors/#");
        consumer.init().await.unwrap();
        let client = factory.last().unwrap();
        client.fail_subscribe(true);

        assert!(consumer.start().await.is_ok());
        assert!(client.subscriptions().is_empty());
        assert!(client.is_connected());

        client.fail_subscribe(false);
        consumer
            .handle_event(ClientEvent::ConnectComplete {
                reconnect: true,
                server_uri: "tcp://localhost:1883".to_string(),
            })
            .await;
        assert_eq!(client.subscriptions(), vec![("sensors/#".to_string(), QoS::AtLeastOnce)]);
    }

    #[tokio::test]
    async fn test_message_gets_mqtt_metadata() {
        let (consumer, _, listener) = consumer("sensors/#");
        consumer.init().await.unwrap();

        consumer
            .handle_event(ClientEvent::MessageArrived(IncomingMessage {
                topic: "sensors/temp".to_string(),
                payload: Bytes::from_static(b"21.5"),
                qos: QoS::ExactlyOnce,
                retained: true,
                duplicate: false,
            }))
            .await;

        let received = listener.messages();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload_str(), "21.5");
        assert_eq!(received[0].metadata_value(TOPIC_METADATA_KEY), Some("sensors/temp"));
        assert_eq!(received[0].metadata_value(QOS_METADATA_KEY), Some("2"));
        assert_eq!(received[0].metadata_value(RETAINED_METADATA_KEY), Some("true"));
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_and_disconnects() {
        let (consumer, factory, _) = consumer("sensors/#");
        consumer.init().await.unwrap();
        consumer.start().await.unwrap();
        let client = factory.last().unwrap();
        client.fail_unsubscribe(true);

        consumer.stop().await;
        assert!(!client.is_connected());
        assert_eq!(client.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_close_skips_unsubscribe_when_disconnected() {
        let (consumer, factory, _) = consumer("sensors/#");
        consumer.init().await.unwrap();
        let client = factory.last().unwrap();
        consumer.stop().await;
        let unsubscribes = client.unsubscriptions().len();

        consumer.close().await;
        assert_eq!(client.unsubscriptions().len(), unsubscribes);
        assert!(client.is_closed());
        assert!(consumer.client().is_none());
    }
}
