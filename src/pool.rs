//! Pool of protocol clients owned by one connection
//!
//! Clients are held in two concurrent maps, one per [`ClientKind`], keyed by
//! client identity. Identities are `<owner>-<library id>` and are generated
//! by the pool; callers pass back an identity they already hold to get the
//! same handle again.
//!
//! Teardown is best effort. `stop` and `close` never return errors: failures
//! are logged, and a failed graceful close falls back to a forced close that
//! always removes the client from the pool.

use crate::error::{ConnectorError, ConnectorResult};
use crate::transport::{ClientFactory, ClientKind, FilePersistence, SharedClient, TransportError};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, trace};

pub struct ClientPool {
    owner_id: String,
    persistence_root: PathBuf,
    factory: Arc<dyn ClientFactory>,
    sync_clients: DashMap<String, SharedClient>,
    async_clients: DashMap<String, SharedClient>,
}

impl ClientPool {
    pub fn new(
        owner_id: impl Into<String>,
        persistence_root: impl Into<PathBuf>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            persistence_root: persistence_root.into(),
            factory,
            sync_clients: DashMap::new(),
            async_clients: DashMap::new(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn clients(&self, kind: ClientKind) -> &DashMap<String, SharedClient> {
        match kind {
            ClientKind::Sync => &self.sync_clients,
            ClientKind::Async => &self.async_clients,
        }
    }

    /// Return the pooled client for `client_id`, or create and register a new one
    ///
    /// An unknown or absent identity always yields a freshly generated one.
    pub fn get_or_create(
        &self,
        client_id: Option<&str>,
        kind: ClientKind,
        server_uri: &str,
    ) -> Result<SharedClient, TransportError> {
        let clients = self.clients(kind);

        if let Some(existing) = client_id.and_then(|id| clients.get(id)) {
            return Ok(existing.value().clone());
        }

        let client_id = format!("{}-{}", self.owner_id, self.factory.generate_client_id());
        let persistence = FilePersistence::new(&self.persistence_root, &client_id, server_uri);
        let client = self
            .factory
            .create(server_uri, &client_id, kind, persistence)?;
        debug!(client_id = %client_id, kind = %kind, "Created MQTT client");

        let registered = clients.entry(client_id).or_insert(client).value().clone();
        Ok(registered)
    }

    pub fn get(&self, kind: ClientKind, client_id: &str) -> Option<SharedClient> {
        self.clients(kind).get(client_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, kind: ClientKind, client_id: &str) -> bool {
        self.clients(kind).contains_key(client_id)
    }

    pub fn len(&self, kind: ClientKind) -> usize {
        self.clients(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.sync_clients.is_empty() && self.async_clients.is_empty()
    }

    /// Handles collected up front so no map shard is locked across an await
    pub fn snapshot(&self, kind: ClientKind) -> Vec<SharedClient> {
        self.clients(kind)
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Gracefully disconnect a connected client; failures are logged
    pub async fn stop(&self, client: &SharedClient) {
        if !client.is_connected() {
            return;
        }

        debug!(client_id = %client.client_id(), "Disconnect MQTT client");
        if let Err(e) = client.disconnect().await {
            let e = ConnectorError::disconnect(client.client_id(), e);
            error!(client_id = %client.client_id(), error = %e, "Could not stop connection");
        }
    }

    /// Disconnect, release and remove a client; falls back to a forced close
    pub async fn close(&self, client: &SharedClient) {
        debug!(client_id = %client.client_id(), "Close MQTT client");
        if let Err(e) = self.graceful_close(client).await {
            error!(client_id = %client.client_id(), error = %e, "Could not close connection, forcing");
            self.force_close(client).await;
        }
    }

    async fn graceful_close(&self, client: &SharedClient) -> ConnectorResult<()> {
        if client.is_connected() {
            client
                .disconnect()
                .await
                .map_err(|e| ConnectorError::disconnect(client.client_id(), e))?;
        }
        client.set_event_sink(None);
        client
            .close()
            .await
            .map_err(|e| ConnectorError::close(client.client_id(), e))?;
        self.remove(client);
        Ok(())
    }

    /// Forced teardown; never fails and always removes the client
    pub async fn force_close(&self, client: &SharedClient) {
        debug!(client_id = %client.client_id(), "Force close MQTT client");
        if let Err(e) = client.disconnect_forcibly().await {
            trace!(client_id = %client.client_id(), "Forced disconnect failed: {}", e);
        }
        client.set_event_sink(None);
        if let Err(e) = client.close().await {
            trace!(client_id = %client.client_id(), "Forced close failed: {}", e);
        }
        self.remove(client);
    }

    fn remove(&self, client: &SharedClient) {
        self.clients(client.kind()).remove(client.client_id());
    }
}
