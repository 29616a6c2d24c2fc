//! Redo Scheduler
//!
//! Periodically walks every redo entry and performs whatever its derived
//! `RedoType` asks for. Failed RPCs leave the entry untouched, so the next
//! sweep tries again; there is no retry limit. Sweeps are skipped while the
//! client has no session.

use super::connection::ClientConnection;
use super::error::ClientError;
use super::redo::{InstancePayload, RedoEntry, RedoRegistry, RedoType, SubscriptionPayload};
use super::rpc::NamingRpc;

use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Performs the RPC the instance entry needs and records the ack.
/// Returns the entry's redo type afterwards.
pub async fn redo_instance(
    rpc: &dyn NamingRpc,
    session_id: &str,
    namespace: &str,
    entry: &mut RedoEntry<InstancePayload>,
) -> Result<RedoType, ClientError> {
    let service = entry.service_key(namespace);
    match entry.redo_type() {
        RedoType::Register => {
            match &entry.payload {
                InstancePayload::Single(instance) => {
                    rpc.register(session_id, &service, instance).await?
                }
                InstancePayload::Batch(instances) => {
                    rpc.batch_register(session_id, &service, instances).await?
                }
            }
            entry.register_acked();
        }
        RedoType::Unregister => {
            match &entry.payload {
                InstancePayload::Single(instance) => {
                    rpc.deregister(session_id, &service, instance).await?
                }
                InstancePayload::Batch(_) => rpc.batch_register(session_id, &service, &[]).await?,
            }
            entry.deregister_acked();
        }
        RedoType::None | RedoType::Remove => {}
    }
    Ok(entry.redo_type())
}

/// Subscription counterpart of `redo_instance`.
pub async fn redo_subscription(
    rpc: &dyn NamingRpc,
    session_id: &str,
    namespace: &str,
    entry: &mut RedoEntry<SubscriptionPayload>,
) -> Result<RedoType, ClientError> {
    let service = entry.service_key(namespace);
    match entry.redo_type() {
        RedoType::Register => {
            rpc.subscribe(session_id, &service, &entry.payload.clusters)
                .await?;
            entry.register_acked();
        }
        RedoType::Unregister => {
            rpc.unsubscribe(session_id, &service, &entry.payload.clusters)
                .await?;
            entry.deregister_acked();
        }
        RedoType::None | RedoType::Remove => {}
    }
    Ok(entry.redo_type())
}

enum Target {
    Instance(String),
    Subscription(String),
}

pub struct RedoScheduler {
    registry: Arc<RedoRegistry>,
    connection: Arc<ClientConnection>,
    rpc: Arc<dyn NamingRpc>,
    period: Duration,
    concurrency: usize,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RedoScheduler {
    pub fn new(
        registry: Arc<RedoRegistry>,
        connection: Arc<ClientConnection>,
        rpc: Arc<dyn NamingRpc>,
        period: Duration,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            connection,
            rpc,
            period,
            concurrency: concurrency.max(1),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }

        let scheduler = self.clone();
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                scheduler.sweep().await;
            }
        }));

        tracing::info!(
            "Redo scheduler started (period={:?}, concurrency={})",
            self.period,
            self.concurrency
        );
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// One pass over every entry. Returns how many entries needed work and
    /// got it done.
    pub async fn sweep(&self) -> usize {
        let Some(session_id) = self.connection.session_id() else {
            tracing::debug!("Skipping redo sweep, not connected");
            return 0;
        };

        let targets: Vec<Target> = self
            .registry
            .instances
            .keys()
            .into_iter()
            .map(Target::Instance)
            .chain(
                self.registry
                    .subscriptions
                    .keys()
                    .into_iter()
                    .map(Target::Subscription),
            )
            .collect();

        let done = stream::iter(targets)
            .map(|target| self.redo(target, &session_id))
            .buffer_unordered(self.concurrency)
            .filter(|done| futures::future::ready(*done))
            .count()
            .await;

        if done > 0 {
            tracing::debug!("Redo sweep completed {} entries", done);
        }
        done
    }

    async fn redo(&self, target: Target, session_id: &str) -> bool {
        let namespace = self.connection.namespace();
        let (key, result) = match target {
            Target::Instance(key) => {
                let Some(mut entry) = self.registry.instances.acquire_existing(&key).await else {
                    return false;
                };
                if entry.redo_type() == RedoType::None {
                    return false;
                }
                let result = redo_instance(self.rpc.as_ref(), session_id, namespace, &mut entry).await;
                if matches!(result, Ok(RedoType::Remove)) {
                    self.registry.instances.remove(&key, &mut entry);
                }
                (key, result)
            }
            Target::Subscription(key) => {
                let Some(mut entry) = self.registry.subscriptions.acquire_existing(&key).await else {
                    return false;
                };
                if entry.redo_type() == RedoType::None {
                    return false;
                }
                let result =
                    redo_subscription(self.rpc.as_ref(), session_id, namespace, &mut entry).await;
                if matches!(result, Ok(RedoType::Remove)) {
                    self.registry.subscriptions.remove(&key, &mut entry);
                }
                (key, result)
            }
        };

        match result {
            Ok(after) => {
                tracing::debug!("Redo of {} done, now {:?}", key, after);
                true
            }
            Err(e) => {
                tracing::warn!("Redo of {} failed, retrying next sweep: {}", key, e);
                if e.is_session_lost() {
                    self.connection.mark_disconnected();
                }
                false
            }
        }
    }
}
