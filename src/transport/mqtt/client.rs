//! Impure I/O for the rumqttc-backed protocol client
//!
//! Each connect spawns an event loop driver task that polls rumqttc, keeps the
//! connection state current, settles acknowledgement waiters and forwards
//! [`ClientEvent`]s to the registered sink. After the first successful connect
//! the driver keeps polling through connection errors, which makes rumqttc
//! reconnect, and sleeps between attempts according to [`ReconnectConfig`].

use super::connection::{
    configure_mqtt_options, connection_timeout, parse_server_uri, ConnectionState, ReconnectConfig,
};
use super::session_rules::{RetryDecision, SessionEvent, SessionRules, SessionStatus};
use super::message_handler::{AckKind, AckReceiver, AckTracker, EventRoute, MessageHandler};
use crate::options::ConnectOptions;
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::{
    ClientEvent, ClientFactory, ClientKind, EventSink, FilePersistence, OutgoingMessage,
    ProtocolClient, SharedClient, TransportError,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long a graceful disconnect may take to flush
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Live connection: request handle plus the driver task
struct Session {
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Session {
    fn abort(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

/// rumqttc implementation of [`ProtocolClient`]
pub struct RumqttClient {
    client_id: String,
    server_uri: String,
    kind: ClientKind,
    persistence: FilePersistence,
    reconnect_config: ReconnectConfig,
    session: AsyncMutex<Option<Session>>,
    state: Arc<watch::Sender<ConnectionState>>,
    closed: AtomicBool,
    event_sink: Arc<RwLock<Option<EventSink>>>,
    time_to_wait: RwLock<Option<Duration>>,
    acks: Arc<Mutex<AckTracker>>,
}

impl RumqttClient {
    pub fn new(
        server_uri: &str,
        client_id: &str,
        kind: ClientKind,
        persistence: FilePersistence,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        Self {
            client_id: client_id.to_string(),
            server_uri: server_uri.to_string(),
            kind,
            persistence,
            reconnect_config,
            session: AsyncMutex::new(None),
            state: Arc::new(state),
            closed: AtomicBool::new(false),
            event_sink: Arc::new(RwLock::new(None)),
            time_to_wait: RwLock::new(None),
            acks: Arc::new(Mutex::new(AckTracker::new())),
        }
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn persistence(&self) -> &FilePersistence {
        &self.persistence
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.client_id.clone()));
        }
        Ok(())
    }

    /// Request handle of the live session
    async fn ready_client(&self) -> Result<AsyncClient, TransportError> {
        self.ensure_open()?;
        if !self.is_connected() {
            return Err(TransportError::NotConnected(self.client_id.clone()));
        }
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or_else(|| TransportError::NotConnected(self.client_id.clone()))
    }

    /// Wait for the driver to report CONNACK or failure
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let confirmation = async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason)
                    | ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(reason));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, confirmation)
                .await
                .map_err(|_| TransportError::Timeout(limit, "connection acknowledgement"))?,
            None => confirmation.await,
        }
    }

    /// Wait for a queued acknowledgement, bounded by time-to-wait
    async fn await_ack(&self, waiter: AckReceiver, kind: AckKind) -> Result<bool, TransportError> {
        let time_to_wait = *self.time_to_wait.read();
        match time_to_wait {
            Some(limit) => tokio::time::timeout(limit, waiter)
                .await
                .map_err(|_| TransportError::Timeout(limit, kind.label()))?
                .map_err(|_| TransportError::AckDropped(kind.label())),
            None => waiter
                .await
                .map_err(|_| TransportError::AckDropped(kind.label())),
        }
    }
}

#[async_trait]
impl ProtocolClient for RumqttClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn server_uri(&self) -> &str {
        &self.server_uri
    }

    fn kind(&self) -> ClientKind {
        self.kind
    }

    fn is_connected(&self) -> bool {
        SessionRules::accepts_requests(&self.state.borrow())
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut session = self.session.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stale.abort();
        }

        let address = parse_server_uri(&self.server_uri)?;
        let mqtt_options = configure_mqtt_options(&self.client_id, &address, options)?;
        self.persistence.open()?;

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state.send_replace(ConnectionState::Connecting);
        let state_rx = self.state.subscribe();

        let driver = EventLoopDriver {
            context: DriverContext {
                client_id: self.client_id.clone(),
                server_uri: self.server_uri.clone(),
                state: self.state.clone(),
                event_sink: self.event_sink.clone(),
                acks: self.acks.clone(),
            },
            event_loop,
            shutdown_rx,
            reconnect_config: self.reconnect_config.clone(),
            automatic_reconnect: options.automatic_reconnect(),
        };
        let handle = tokio::spawn(driver.run());

        match Self::wait_for_connection_confirmation(state_rx, connection_timeout(options)).await {
            Ok(()) => {
                info!(client_id = %self.client_id, server_uri = %self.server_uri, "MQTT client connected");
                *session = Some(Session {
                    client,
                    shutdown_tx,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                Session {
                    client,
                    shutdown_tx,
                    handle,
                }
                .abort();
                self.state
                    .send_replace(ConnectionState::Disconnected(e.to_string()));
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        if !self.is_connected() {
            // reconnecting; stop the driver instead of waiting for it
            if let Some(stale) = session.take() {
                stale.abort();
            }
            return Ok(());
        }
        let Some(active) = session.as_mut() else {
            return Ok(());
        };

        active
            .client
            .disconnect()
            .await
            .map_err(TransportError::Request)?;

        match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut active.handle).await {
            Ok(Ok(())) => debug!(target: "mqtt_transport", client_id = %self.client_id, "Event loop stopped after disconnect"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => return Err(TransportError::Timeout(DISCONNECT_TIMEOUT, "disconnect")),
        }

        session.take();
        info!(client_id = %self.client_id, "MQTT client disconnected");
        Ok(())
    }

    async fn disconnect_forcibly(&self) -> Result<(), TransportError> {
        if let Some(active) = self.session.lock().await.take() {
            active.abort();
        }
        let next = SessionRules::next_state(SessionEvent::ClientDisconnect);
        self.state.send_replace(next);
        self.acks.lock().fail_all();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.is_connected() {
            return Err(TransportError::StillConnected(self.client_id.clone()));
        }

        self.closed.store(true, Ordering::SeqCst);
        self.event_sink.write().take();
        if let Some(active) = self.session.lock().await.take() {
            active.abort();
        }
        self.acks.lock().fail_all();
        self.persistence.close()?;
        debug!(client_id = %self.client_id, "MQTT client closed");
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        validate_topic_filter(topic_filter).map_err(|reason| TransportError::InvalidTopic {
            topic: topic_filter.to_string(),
            reason,
        })?;
        let client = self.ready_client().await?;

        match self.kind {
            ClientKind::Async => client
                .subscribe(topic_filter, qos)
                .await
                .map_err(TransportError::Request),
            ClientKind::Sync => {
                let waiter = {
                    let mut acks = self.acks.lock();
                    client
                        .try_subscribe(topic_filter, qos)
                        .map_err(TransportError::Request)?;
                    acks.enqueue(AckKind::Subscribe)
                };
                if self.await_ack(waiter, AckKind::Subscribe).await? {
                    Ok(())
                } else {
                    Err(TransportError::SubscriptionRejected(topic_filter.to_string()))
                }
            }
        }
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        let client = self.ready_client().await?;

        match self.kind {
            ClientKind::Async => client
                .unsubscribe(topic_filter)
                .await
                .map_err(TransportError::Request),
            ClientKind::Sync => {
                let waiter = {
                    let mut acks = self.acks.lock();
                    client
                        .try_unsubscribe(topic_filter)
                        .map_err(TransportError::Request)?;
                    acks.enqueue(AckKind::Unsubscribe)
                };
                self.await_ack(waiter, AckKind::Unsubscribe).await.map(|_| ())
            }
        }
    }

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<(), TransportError> {
        validate_topic_name(topic).map_err(|reason| TransportError::InvalidTopic {
            topic: topic.to_string(),
            reason,
        })?;
        let client = self.ready_client().await?;
        let OutgoingMessage {
            payload,
            qos,
            retained,
        } = message;

        match self.kind {
            ClientKind::Async => client
                .publish(topic, qos, retained, payload.to_vec())
                .await
                .map_err(TransportError::Request),
            ClientKind::Sync => {
                let waiter = {
                    let mut acks = self.acks.lock();
                    client
                        .try_publish(topic, qos, retained, payload.to_vec())
                        .map_err(TransportError::Request)?;
                    acks.enqueue(AckKind::Publish)
                };
                self.await_ack(waiter, AckKind::Publish).await.map(|_| ())
            }
        }
    }

    fn topic(&self, name: &str) -> Result<String, TransportError> {
        validate_topic_name(name).map_err(|reason| TransportError::InvalidTopic {
            topic: name.to_string(),
            reason,
        })?;
        Ok(name.to_string())
    }

    fn set_event_sink(&self, sink: Option<EventSink>) {
        *self.event_sink.write() = sink;
    }

    fn set_time_to_wait(&self, time_to_wait: Option<Duration>) {
        *self.time_to_wait.write() = time_to_wait;
    }
}

/// State shared between a client and its driver task
struct DriverContext {
    client_id: String,
    server_uri: String,
    state: Arc<watch::Sender<ConnectionState>>,
    event_sink: Arc<RwLock<Option<EventSink>>>,
    acks: Arc<Mutex<AckTracker>>,
}

impl DriverContext {
    fn transition(&self, event: SessionEvent) {
        let next = SessionRules::next_state(event);
        let previous = self.state.send_replace(next.clone());
        SessionRules::log_transition(&self.client_id, &previous, &next);
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(sink) = self.event_sink.read().as_ref() {
            if sink.send(event).is_err() {
                debug!(target: "mqtt_transport", client_id = %self.client_id, "Event receiver dropped");
            }
        }
    }

    /// Returns false when the driver should stop
    fn process_event_route(
        &self,
        route: EventRoute,
        ever_connected: &mut bool,
        reconnect_attempts: &mut u32,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                let reconnect = *ever_connected;
                *ever_connected = true;
                *reconnect_attempts = 0;
                self.transition(SessionEvent::ConnAck);
                debug!(target: "mqtt_transport", client_id = %self.client_id, session_present, reconnect, "ConnAck received");
                self.emit(ClientEvent::ConnectComplete {
                    reconnect,
                    server_uri: self.server_uri.clone(),
                });
                true
            }
            EventRoute::MessageReceived(message) => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", message.topic);
                self.emit(ClientEvent::MessageArrived(message));
                true
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                self.acks.lock().complete(AckKind::Publish, packet_id, true);
                self.emit(ClientEvent::DeliveryComplete { packet_id });
                true
            }
            EventRoute::SubscriptionAcknowledged {
                packet_id,
                accepted,
            } => {
                if !accepted {
                    warn!(client_id = %self.client_id, packet_id, "Broker refused subscription");
                }
                self.acks
                    .lock()
                    .complete(AckKind::Subscribe, packet_id, accepted);
                true
            }
            EventRoute::UnsubscriptionAcknowledged { packet_id } => {
                self.acks
                    .lock()
                    .complete(AckKind::Unsubscribe, packet_id, true);
                true
            }
            EventRoute::Disconnected => {
                self.transition(SessionEvent::BrokerDisconnect);
                true
            }
            EventRoute::RequestSent { kind, packet_id } => {
                self.acks.lock().assign(kind, packet_id);
                if kind == AckKind::Publish && packet_id == 0 {
                    self.emit(ClientEvent::DeliveryComplete { packet_id });
                }
                true
            }
            EventRoute::DisconnectSent => {
                self.transition(SessionEvent::ClientDisconnect);
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }
}

/// Polls one rumqttc event loop until disconnect, shutdown or permanent failure
struct EventLoopDriver {
    context: DriverContext,
    event_loop: EventLoop,
    shutdown_rx: watch::Receiver<bool>,
    reconnect_config: ReconnectConfig,
    automatic_reconnect: bool,
}

impl EventLoopDriver {
    async fn run(self) {
        let EventLoopDriver {
            context,
            mut event_loop,
            mut shutdown_rx,
            reconnect_config,
            automatic_reconnect,
        } = self;

        debug!(target: "mqtt_transport", client_id = %context.client_id, "Starting MQTT event loop");
        let mut ever_connected = false;
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!(target: "mqtt_transport", client_id = %context.client_id, "Shutdown signal received");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !context.process_event_route(route, &mut ever_connected, &mut reconnect_attempts) {
                                break;
                            }
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            context.transition(SessionEvent::NetworkError(reason.clone()));
                            if ever_connected {
                                context.emit(ClientEvent::ConnectionLost { cause: reason.clone() });
                            }

                            let status = SessionStatus {
                                ever_connected,
                                automatic_reconnect,
                                shutdown_requested: *shutdown_rx.borrow(),
                            };
                            match SessionRules::after_connection_error(reconnect_attempts, &reconnect_config, status) {
                                RetryDecision::Retry { attempt, delay_ms } => {
                                    reconnect_attempts = attempt;
                                    context.transition(SessionEvent::Reconnecting(attempt));
                                    if !interruptible_sleep(&mut shutdown_rx, delay_ms).await {
                                        break;
                                    }
                                }
                                RetryDecision::StopNeverConnected => {
                                    error!(client_id = %context.client_id, "MQTT connection failed: {}", reason);
                                    break;
                                }
                                RetryDecision::StopShuttingDown => break,
                                RetryDecision::StopReconnectDisabled
                                | RetryDecision::StopAttemptsExhausted => {
                                    context.transition(SessionEvent::GaveUp(reason));
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        if SessionRules::accepts_requests(&context.state.borrow()) {
            context.transition(SessionEvent::ClientDisconnect);
        }
        context.acks.lock().fail_all();
        debug!(target: "mqtt_transport", client_id = %context.client_id, "MQTT event loop stopped");
    }
}

/// Sleep unless shutdown is signalled first; true if the sleep completed
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}

/// Creates [`RumqttClient`]s
#[derive(Debug, Clone, Default)]
pub struct RumqttClientFactory {
    reconnect_config: ReconnectConfig,
}

impl RumqttClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reconnect_config(reconnect_config: ReconnectConfig) -> Self {
        Self { reconnect_config }
    }
}

impl ClientFactory for RumqttClientFactory {
    fn generate_client_id(&self) -> String {
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
        format!("rumqttc{suffix}")
    }

    fn create(
        &self,
        server_uri: &str,
        client_id: &str,
        kind: ClientKind,
        persistence: FilePersistence,
    ) -> Result<SharedClient, TransportError> {
        parse_server_uri(server_uri)?;
        Ok(Arc::new(RumqttClient::new(
            server_uri,
            client_id,
            kind,
            persistence,
            self.reconnect_config.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use tempfile::TempDir;

    fn client(temp: &TempDir, server_uri: &str) -> RumqttClient {
        RumqttClient::new(
            server_uri,
            "owner-test",
            ClientKind::Sync,
            FilePersistence::new(temp.path(), "owner-test", server_uri),
            ReconnectConfig::default(),
        )
    }

    #[test]
    fn test_factory_generates_distinct_ids() {
        let factory = RumqttClientFactory::new();
        let first = factory.generate_client_id();
        let second = factory.generate_client_id();

        assert!(first.starts_with("rumqttc"));
        assert_eq!(first.len(), "rumqttc".len() + 12);
        assert_ne!(first, second);
    }

    #[test]
    fn test_factory_rejects_bad_uri() {
        let temp = TempDir::new().unwrap();
        let factory = RumqttClientFactory::new();
        let result = factory.create(
            "not a uri",
            "id",
            ClientKind::Sync,
            FilePersistence::new(temp.path(), "id", "x"),
        );
        assert!(matches!(result, Err(TransportError::InvalidServerUri(_))));
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let temp = TempDir::new().unwrap();
        let client = client(&temp, "tcp://localhost:1883");

        assert!(!client.is_connected());
        assert_eq!(client.kind(), ClientKind::Sync);
        assert!(matches!(
            client.publish("a/b", OutgoingMessage::new("x")).await,
            Err(TransportError::NotConnected(_))
        ));
        // disconnecting an idle client is a no-op
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let temp = TempDir::new().unwrap();
        // nothing listens on port 1 on loopback
        let client = client(&temp, "tcp://127.0.0.1:1");
        let mut config = ConnectionConfig::new("tcp://127.0.0.1:1");
        config.connection_timeout = Some(Duration::from_secs(5));
        let options = ConnectOptions::build(&config).unwrap();

        let result = client.connect(&options).await;

        assert!(result.is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let temp = TempDir::new().unwrap();
        let client = client(&temp, "tcp://localhost:1883");

        client.close().await.unwrap();
        client.close().await.unwrap();

        let options = ConnectOptions::default();
        assert!(matches!(
            client.connect(&options).await,
            Err(TransportError::Closed(_))
        ));
    }

    #[test]
    fn test_topic_resolution() {
        let temp = TempDir::new().unwrap();
        let client = client(&temp, "tcp://localhost:1883");

        assert_eq!(client.topic("out/a").unwrap(), "out/a");
        assert!(matches!(
            client.topic("out/#"),
            Err(TransportError::InvalidTopic { .. })
        ));
    }
}
