//! Naming Client
//!
//! Public entry point of the client side. Every mutation first records the
//! caller's intent in the redo registry, then makes one best-effort RPC. A
//! failed RPC is not an error for the caller: the redo scheduler keeps the
//! entry converging in the background.

use super::config::ClientConfig;
use super::connection::ClientConnection;
use super::error::ClientError;
use super::redo::{InstancePayload, RedoEntry, RedoRegistry, RedoType, SubscriptionPayload};
use super::rpc::{HttpNamingClient, NamingRpc};
use super::scheduler::{RedoScheduler, redo_instance, redo_subscription};
use crate::naming::types::{Instance, ServiceKey};

use anyhow::Result;
use std::sync::Arc;

pub struct NamingClient {
    config: ClientConfig,
    rpc: Arc<dyn NamingRpc>,
    registry: Arc<RedoRegistry>,
    connection: Arc<ClientConnection>,
    scheduler: Arc<RedoScheduler>,
}

impl NamingClient {
    /// Client talking HTTP to `config.server_addr`.
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let rpc = Arc::new(HttpNamingClient::new(&config.server_addr, config.rpc_timeout()));
        Ok(Self::with_rpc(config, rpc))
    }

    pub fn with_rpc(config: ClientConfig, rpc: Arc<dyn NamingRpc>) -> Arc<Self> {
        let registry = RedoRegistry::new();
        let connection = ClientConnection::new(
            rpc.clone(),
            registry.clone(),
            &config.namespace,
            config.heartbeat_interval(),
        );
        let scheduler = RedoScheduler::new(
            registry.clone(),
            connection.clone(),
            rpc.clone(),
            config.redo_sweep_period(),
            config.redo_concurrency,
        );

        Arc::new(Self {
            config,
            rpc,
            registry,
            connection,
            scheduler,
        })
    }

    /// Connects (best effort) and starts the heartbeat and the redo sweep.
    pub async fn start(&self) {
        if let Err(e) = self.connection.connect().await {
            tracing::warn!("Initial connect to {} failed: {}", self.config.server_addr, e);
        }
        self.connection.start();
        self.scheduler.start();
    }

    pub fn stop(&self) {
        self.scheduler.stop();
        self.connection.stop();
    }

    pub fn registry(&self) -> &Arc<RedoRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    pub fn scheduler(&self) -> &Arc<RedoScheduler> {
        &self.scheduler
    }

    /// Registers `instance` as this client's instance of the service.
    /// Returns `true` when the server already acknowledged it.
    pub async fn register_instance(&self, service_name: &str, group_name: &str, instance: Instance) -> bool {
        self.register_payload(service_name, group_name, InstancePayload::Single(instance.normalized()))
            .await
    }

    /// Registers the whole set of this client's instances of the service.
    pub async fn batch_register_instance(
        &self,
        service_name: &str,
        group_name: &str,
        instances: Vec<Instance>,
    ) -> bool {
        let instances = instances.into_iter().map(Instance::normalized).collect();
        self.register_payload(service_name, group_name, InstancePayload::Batch(instances))
            .await
    }

    async fn register_payload(&self, service_name: &str, group_name: &str, payload: InstancePayload) -> bool {
        let key = RedoRegistry::instance_key(service_name, group_name);
        let mut entry = self
            .registry
            .instances
            .acquire(&key, || RedoEntry::new(service_name, group_name, payload.clone()))
            .await;
        entry.set_register_intent(payload);

        let result = match self.connection.session_id() {
            Some(session) => {
                redo_instance(self.rpc.as_ref(), &session, &self.config.namespace, &mut entry).await
            }
            None => Err(ClientError::NotConnected),
        };

        match result {
            Ok(redo_type) => redo_type == RedoType::None,
            Err(e) => {
                self.note_failure(&e);
                tracing::warn!("Register of {} pending redo: {}", key, e);
                false
            }
        }
    }

    /// Withdraws this client's instance of the service. Returns `true` when
    /// the server acknowledged it (or there was nothing to withdraw).
    pub async fn deregister_instance(&self, service_name: &str, group_name: &str) -> bool {
        let key = RedoRegistry::instance_key(service_name, group_name);
        let Some(mut entry) = self.registry.instances.acquire_existing(&key).await else {
            return true;
        };
        entry.set_deregister_intent();

        let result = match self.connection.session_id() {
            Some(session) => {
                redo_instance(self.rpc.as_ref(), &session, &self.config.namespace, &mut entry).await
            }
            None => Err(ClientError::NotConnected),
        };

        match result {
            Ok(RedoType::Remove) => {
                self.registry.instances.remove(&key, &mut entry);
                true
            }
            Ok(_) => false,
            Err(e) => {
                self.note_failure(&e);
                tracing::warn!("Deregister of {} pending redo: {}", key, e);
                false
            }
        }
    }

    /// Subscribes to the service, optionally restricted to `clusters`
    /// (comma separated). Returns `true` when the server acknowledged it.
    pub async fn subscribe(&self, service_name: &str, group_name: &str, clusters: &str) -> bool {
        let key = RedoRegistry::subscription_key(service_name, group_name, clusters);
        let payload = SubscriptionPayload {
            clusters: clusters.to_string(),
        };
        let mut entry = self
            .registry
            .subscriptions
            .acquire(&key, || RedoEntry::new(service_name, group_name, payload.clone()))
            .await;
        entry.set_register_intent(payload);

        let result = match self.connection.session_id() {
            Some(session) => {
                redo_subscription(self.rpc.as_ref(), &session, &self.config.namespace, &mut entry)
                    .await
            }
            None => Err(ClientError::NotConnected),
        };

        match result {
            Ok(redo_type) => redo_type == RedoType::None,
            Err(e) => {
                self.note_failure(&e);
                tracing::warn!("Subscribe to {} pending redo: {}", key, e);
                false
            }
        }
    }

    pub async fn unsubscribe(&self, service_name: &str, group_name: &str, clusters: &str) -> bool {
        let key = RedoRegistry::subscription_key(service_name, group_name, clusters);
        let Some(mut entry) = self.registry.subscriptions.acquire_existing(&key).await else {
            return true;
        };
        entry.set_deregister_intent();

        let result = match self.connection.session_id() {
            Some(session) => {
                redo_subscription(self.rpc.as_ref(), &session, &self.config.namespace, &mut entry)
                    .await
            }
            None => Err(ClientError::NotConnected),
        };

        match result {
            Ok(RedoType::Remove) => {
                self.registry.subscriptions.remove(&key, &mut entry);
                true
            }
            Ok(_) => false,
            Err(e) => {
                self.note_failure(&e);
                tracing::warn!("Unsubscribe from {} pending redo: {}", key, e);
                false
            }
        }
    }

    /// Current instances of the service as seen by the connected node.
    pub async fn get_instances(&self, service_name: &str, group_name: &str) -> Result<Vec<Instance>, ClientError> {
        let service = ServiceKey::new(&self.config.namespace, group_name, service_name);
        self.rpc.list_instances(&service).await
    }

    fn note_failure(&self, e: &ClientError) {
        if e.is_session_lost() {
            self.connection.mark_disconnected();
        }
    }
}
