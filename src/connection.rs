//! Shared MQTT connection
//!
//! An [`MqttConnection`] owns the connection configuration, the connect
//! options built from it, and the pool of protocol clients handed out to
//! consumers and producers. Endpoints share one connection through an `Arc`.
//!
//! # Lifecycle
//!
//! ```text
//! Unconfigured -> Prepared -> Initialized -> Started <-> Stopped -> Closed
//! ```
//!
//! `init` builds the connect options exactly once; `start` connects nothing
//! by itself, endpoints connect their own clients through
//! [`MqttConnection::start_client`]. `stop` and `close` are best effort over
//! every pooled client.

use crate::config::{ConfigError, ConnectionConfig};
use crate::error::{ConnectorError, ConnectorResult};
use crate::options::ConnectOptions;
use crate::pool::ClientPool;
use crate::transport::mqtt::RumqttClientFactory;
use crate::transport::{ClientFactory, ClientKind, FilePersistence, SharedClient};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unconfigured,
    Prepared,
    Initialized,
    Started,
    Stopped,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Prepared => "prepared",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Started => "started",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

pub struct MqttConnection {
    unique_id: String,
    config: RwLock<ConnectionConfig>,
    options: OnceCell<Arc<ConnectOptions>>,
    state: Mutex<LifecycleState>,
    pool: ClientPool,
}

impl MqttConnection {
    /// Connection backed by rumqttc clients
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_factory(config, Arc::new(RumqttClientFactory::new()))
    }

    pub fn with_factory(config: ConnectionConfig, factory: Arc<dyn ClientFactory>) -> Self {
        let unique_id = config
            .unique_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let persistence_root = config
            .persistence_dir
            .clone()
            .unwrap_or_else(FilePersistence::default_root);

        Self {
            pool: ClientPool::new(unique_id.clone(), persistence_root, factory),
            unique_id,
            config: RwLock::new(config),
            options: OnceCell::new(),
            state: Mutex::new(LifecycleState::Unconfigured),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Copy of the current configuration
    pub fn config(&self) -> ConnectionConfig {
        self.config.read().clone()
    }

    /// Mutate the configuration; ignored by options that were already built
    pub fn configure<F>(&self, update: F)
    where
        F: FnOnce(&mut ConnectionConfig),
    {
        if self.options.get().is_some() {
            warn!(
                unique_id = %self.unique_id,
                "Connect options already built; configuration changes will not apply"
            );
        }
        update(&mut self.config.write());
    }

    pub fn pool(&self) -> &ClientPool {
        &self.pool
    }

    /// Build the connect options on first use and return the cached value after
    pub fn connect_options(&self) -> Result<Arc<ConnectOptions>, ConfigError> {
        self.options
            .get_or_try_init(|| {
                let config = self.config.read();
                debug!(unique_id = %self.unique_id, "Building MQTT connect options");
                ConnectOptions::build(&config).map(Arc::new)
            })
            .cloned()
    }

    /// Options if they have been built
    pub fn retrieve_options(&self) -> Option<Arc<ConnectOptions>> {
        self.options.get().cloned()
    }

    pub fn prepare(&self) -> ConnectorResult<()> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Unconfigured => {
                self.config.read().validate()?;
                *state = LifecycleState::Prepared;
                Ok(())
            }
            LifecycleState::Closed => Err(ConnectorError::invalid_state("prepare", *state)),
            _ => Ok(()),
        }
    }

    pub fn init(&self) -> ConnectorResult<()> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Unconfigured => self.config.read().validate()?,
            LifecycleState::Prepared => {}
            LifecycleState::Closed => return Err(ConnectorError::invalid_state("init", *state)),
            _ => return Ok(()),
        }

        self.connect_options()?;
        *state = LifecycleState::Initialized;
        debug!(unique_id = %self.unique_id, "MQTT connection initialised");
        Ok(())
    }

    pub fn start(&self) -> ConnectorResult<()> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Initialized | LifecycleState::Stopped => {
                *state = LifecycleState::Started;
                debug!(unique_id = %self.unique_id, "MQTT connection started");
                Ok(())
            }
            LifecycleState::Started => Ok(()),
            other => Err(ConnectorError::invalid_state("start", other)),
        }
    }

    /// Disconnect every pooled client
    ///
    /// Endpoints connect their clients during their own `init`, so this also
    /// applies to a connection that was initialized but never started.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, LifecycleState::Initialized | LifecycleState::Started) {
                return;
            }
            *state = LifecycleState::Stopped;
        }

        self.stop_all_clients()
            .instrument(crate::lifecycle_span!("stop", unique_id = %self.unique_id))
            .await;
    }

    /// Close every pooled client; terminal
    pub async fn close(&self) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, LifecycleState::Closed)
        };

        match previous {
            LifecycleState::Closed => return,
            LifecycleState::Initialized | LifecycleState::Started => {
                self.stop_all_clients()
                    .instrument(crate::lifecycle_span!("stop", unique_id = %self.unique_id))
                    .await;
            }
            _ => {}
        }

        self.close_all_clients()
            .instrument(crate::lifecycle_span!("close", unique_id = %self.unique_id))
            .await;
        info!(unique_id = %self.unique_id, "MQTT connection closed");
    }

    async fn stop_all_clients(&self) {
        for kind in [ClientKind::Sync, ClientKind::Async] {
            for client in self.pool.snapshot(kind) {
                self.pool.stop(&client).await;
            }
        }
    }

    async fn close_all_clients(&self) {
        for kind in [ClientKind::Sync, ClientKind::Async] {
            for client in self.pool.snapshot(kind) {
                self.pool.close(&client).await;
            }
        }
    }

    pub fn get_or_create_sync_client(&self, client_id: Option<&str>) -> ConnectorResult<SharedClient> {
        self.get_or_create_client(client_id, ClientKind::Sync)
    }

    pub fn get_or_create_async_client(&self, client_id: Option<&str>) -> ConnectorResult<SharedClient> {
        self.get_or_create_client(client_id, ClientKind::Async)
    }

    fn get_or_create_client(
        &self,
        client_id: Option<&str>,
        kind: ClientKind,
    ) -> ConnectorResult<SharedClient> {
        let state = self.state();
        if state == LifecycleState::Closed {
            return Err(ConnectorError::invalid_state("create client", state));
        }

        let server_uri = self.config.read().server_uri.clone();
        if server_uri.trim().is_empty() {
            return Err(ConfigError::MissingServerUri.into());
        }

        self.pool
            .get_or_create(client_id, kind, &server_uri)
            .map_err(ConnectorError::ClientCreation)
    }

    pub fn sync_client(&self, client_id: &str) -> Option<SharedClient> {
        self.pool.get(ClientKind::Sync, client_id)
    }

    pub fn async_client(&self, client_id: &str) -> Option<SharedClient> {
        self.pool.get(ClientKind::Async, client_id)
    }

    /// Connect the client with the shared options unless it already is
    pub async fn start_client(&self, client: &SharedClient) -> ConnectorResult<()> {
        if client.is_connected() {
            return Ok(());
        }

        debug!(client_id = %client.client_id(), "Connect MQTT client");
        let options = self
            .connect_options()
            .map_err(|e| ConnectorError::connect(client.client_id(), e))?;
        client
            .connect(&options)
            .await
            .map_err(|e| ConnectorError::connect(client.client_id(), e))
    }

    pub async fn stop_client(&self, client: &SharedClient) {
        self.pool.stop(client).await;
    }

    pub async fn close_client(&self, client: &SharedClient) {
        self.pool.close(client).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockClientFactory;

    fn connection() -> MqttConnection {
        MqttConnection::with_factory(
            ConnectionConfig::new("tcp://localhost:1883").with_unique_id("owner"),
            Arc::new(MockClientFactory::new()),
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let connection = connection();
        assert_eq!(connection.state(), LifecycleState::Unconfigured);

        connection.prepare().unwrap();
        assert_eq!(connection.state(), LifecycleState::Prepared);
        connection.init().unwrap();
        connection.init().unwrap();
        assert_eq!(connection.state(), LifecycleState::Initialized);
        connection.start().unwrap();
        assert_eq!(connection.state(), LifecycleState::Started);
    }

    #[test]
    fn test_start_requires_init() {
        let connection = connection();
        assert!(matches!(
            connection.start(),
            Err(ConnectorError::InvalidState { operation: "start", .. })
        ));
    }

    #[test]
    fn test_prepare_requires_server_uri() {
        let connection = MqttConnection::with_factory(
            ConnectionConfig::default(),
            Arc::new(MockClientFactory::new()),
        );
        assert!(matches!(
            connection.prepare(),
            Err(ConnectorError::Config(ConfigError::MissingServerUri))
        ));
        assert!(matches!(
            connection.get_or_create_sync_client(None),
            Err(ConnectorError::Config(ConfigError::MissingServerUri))
        ));
    }

    #[test]
    fn test_init_failure_is_wrapped() {
        let connection = MqttConnection::with_factory(
            ConnectionConfig::new("tcp://localhost:1883").with_credentials("user", "PW:***"),
            Arc::new(MockClientFactory::new()),
        );
        assert!(matches!(
            connection.init(),
            Err(ConnectorError::Config(ConfigError::Password(_)))
        ));
        assert_eq!(connection.state(), LifecycleState::Unconfigured);
    }

    #[test]
    fn test_options_built_once() {
        let connection = connection();
        assert!(connection.retrieve_options().is_none());

        connection.init().unwrap();
        let first = connection.connect_options().unwrap();
        connection.configure(|c| c.username = Some("late".to_string()));
        let second = connection.connect_options().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.username().is_none());
    }

    #[test]
    fn test_generated_unique_id() {
        let connection = MqttConnection::with_factory(
            ConnectionConfig::new("tcp://localhost:1883"),
            Arc::new(MockClientFactory::new()),
        );
        assert!(Uuid::parse_str(connection.unique_id()).is_ok());
    }

    #[tokio::test]
    async fn test_stop_before_start_disconnects_endpoint_clients() {
        let factory = Arc::new(MockClientFactory::new());
        let connection = MqttConnection::with_factory(
            ConnectionConfig::new("tcp://localhost:1883").with_unique_id("owner"),
            factory.clone(),
        );
        connection.init().unwrap();
        let client = connection.get_or_create_sync_client(None).unwrap();
        connection.start_client(&client).await.unwrap();

        connection.stop().await;

        assert_eq!(connection.state(), LifecycleState::Stopped);
        assert!(!client.is_connected());
        assert_eq!(factory.last().unwrap().disconnect_count(), 1);
        connection.start().unwrap();
    }

    #[tokio::test]
    async fn test_closed_is_terminal() {
        let connection = connection();
        connection.init().unwrap();
        connection.close().await;
        connection.close().await;

        assert_eq!(connection.state(), LifecycleState::Closed);
        assert!(connection.start().is_err());
        assert!(connection.init().is_err());
        assert!(connection.get_or_create_sync_client(None).is_err());
    }
}
