//! Mock implementations for testing
//!
//! Provides a mock [`ProtocolClient`], its [`ClientFactory`] and a recording
//! [`MessageListener`] so connection management and endpoints can be tested
//! without a broker.

use crate::message::{AdapterMessage, MessageListener};
use crate::options::ConnectOptions;
use crate::topic::validate_topic_name;
use crate::transport::{
    ClientEvent, ClientFactory, ClientKind, EventSink, FilePersistence, OutgoingMessage,
    ProtocolClient, SharedClient, TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type PublishedMessage = (String, OutgoingMessage);

/// Protocol client that records every call
#[derive(Debug)]
pub struct MockProtocolClient {
    client_id: String,
    server_uri: String,
    kind: ClientKind,
    persistence: FilePersistence,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    closed: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    forced_disconnects: AtomicUsize,
    closes: AtomicUsize,
    topic_lookups: AtomicUsize,
    should_fail_connect: AtomicBool,
    should_fail_disconnect: AtomicBool,
    should_fail_close: AtomicBool,
    should_fail_subscribe: AtomicBool,
    should_fail_unsubscribe: AtomicBool,
    should_fail_publish: AtomicBool,
    last_options: Mutex<Option<ConnectOptions>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    unsubscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    event_sink: Mutex<Option<EventSink>>,
    time_to_wait: Mutex<Option<Duration>>,
}

impl MockProtocolClient {
    pub fn new(
        client_id: impl Into<String>,
        server_uri: impl Into<String>,
        kind: ClientKind,
        persistence: FilePersistence,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            server_uri: server_uri.into(),
            kind,
            persistence,
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            forced_disconnects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            topic_lookups: AtomicUsize::new(0),
            should_fail_connect: AtomicBool::new(false),
            should_fail_disconnect: AtomicBool::new(false),
            should_fail_close: AtomicBool::new(false),
            should_fail_subscribe: AtomicBool::new(false),
            should_fail_unsubscribe: AtomicBool::new(false),
            should_fail_publish: AtomicBool::new(false),
            last_options: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            event_sink: Mutex::new(None),
            time_to_wait: Mutex::new(None),
        }
    }

    pub fn fail_connect(&self, fail: bool) {
        self.should_fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.should_fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.should_fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.should_fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unsubscribe(&self, fail: bool) {
        self.should_fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.should_fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Simulate a broker-side connection change without going through `connect`
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.ever_connected.store(true, Ordering::SeqCst);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn forced_disconnect_count(&self) -> usize {
        self.forced_disconnects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn topic_lookups(&self) -> usize {
        self.topic_lookups.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn persistence(&self) -> &FilePersistence {
        &self.persistence
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.last_options.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscriptions.lock().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn has_event_sink(&self) -> bool {
        self.event_sink.lock().is_some()
    }

    pub fn time_to_wait(&self) -> Option<Duration> {
        *self.time_to_wait.lock()
    }

    /// Deliver an event to the registered sink; false when there is none
    pub fn emit(&self, event: ClientEvent) -> bool {
        match self.event_sink.lock().as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.client_id.clone()));
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected(self.client_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
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
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.client_id.clone()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.should_fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }

        *self.last_options.lock() = Some(options.clone());
        let reconnect = self.ever_connected.swap(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ClientEvent::ConnectComplete {
            reconnect,
            server_uri: self.server_uri.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.should_fail_disconnect.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(Duration::from_secs(5), "disconnect"));
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect_forcibly(&self) -> Result<(), TransportError> {
        self.forced_disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.is_connected() {
            return Err(TransportError::StillConnected(self.client_id.clone()));
        }
        if self.should_fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Persistence(std::io::Error::other(
                "Mock close failure",
            )));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.ensure_usable()?;
        if self.should_fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SubscriptionRejected(topic_filter.to_string()));
        }
        self.subscriptions
            .lock()
            .push((topic_filter.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        self.ensure_usable()?;
        if self.should_fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(Duration::from_secs(1), "unsuback"));
        }
        self.unsubscriptions.lock().push(topic_filter.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<(), TransportError> {
        self.ensure_usable()?;
        if self.should_fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(Duration::from_secs(1), "puback"));
        }
        self.published.lock().push((topic.to_string(), message));
        Ok(())
    }

    fn topic(&self, name: &str) -> Result<String, TransportError> {
        self.topic_lookups.fetch_add(1, Ordering::SeqCst);
        validate_topic_name(name).map_err(|reason| TransportError::InvalidTopic {
            topic: name.to_string(),
            reason,
        })?;
        Ok(name.to_string())
    }

    fn set_event_sink(&self, sink: Option<EventSink>) {
        *self.event_sink.lock() = sink;
    }

    fn set_time_to_wait(&self, time_to_wait: Option<Duration>) {
        *self.time_to_wait.lock() = time_to_wait;
    }
}

/// Factory handing out [`MockProtocolClient`]s with ids `mock0001`, `mock0002`, ...
#[derive(Debug, Default)]
pub struct MockClientFactory {
    sequence: AtomicUsize,
    should_fail: AtomicBool,
    created: Mutex<Vec<Arc<MockProtocolClient>>>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn created(&self) -> Vec<Arc<MockProtocolClient>> {
        self.created.lock().clone()
    }

    pub fn client(&self, client_id: &str) -> Option<Arc<MockProtocolClient>> {
        self.created
            .lock()
            .iter()
            .find(|client| client.client_id == client_id)
            .cloned()
    }

    pub fn last(&self) -> Option<Arc<MockProtocolClient>> {
        self.created.lock().last().cloned()
    }
}

impl ClientFactory for MockClientFactory {
    fn generate_client_id(&self) -> String {
        format!("mock{:04}", self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn create(
        &self,
        server_uri: &str,
        client_id: &str,
        kind: ClientKind,
        persistence: FilePersistence,
    ) -> Result<SharedClient, TransportError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidServerUri(server_uri.to_string()));
        }

        let client = Arc::new(MockProtocolClient::new(
            client_id,
            server_uri,
            kind,
            persistence,
        ));
        self.created.lock().push(client.clone());
        Ok(client as SharedClient)
    }
}

/// Listener that keeps every message it receives
#[derive(Debug, Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<AdapterMessage>>,
    should_fail: AtomicBool,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<AdapterMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl MessageListener for RecordingListener {
    async fn on_message(&self, message: AdapterMessage) -> Result<(), String> {
        self.messages.lock().push(message);
        if self.should_fail.load(Ordering::SeqCst) {
            return Err("Mock listener failure".to_string());
        }
        Ok(())
    }
}
