//! Combined Executor
//!
//! Fires a due batch: reads the *current* state of its keys from the local
//! store (not the state at enqueue time), serializes it and pushes it to the
//! target peer under a bounded timeout. Transport failures go to the
//! `FailureHandler`; everything else drops the batch.

use super::delay::SyncTaskProcessor;
use super::error::SyncError;
use super::failure::FailureHandler;
use super::protocol::SyncRequest;
use super::transport::SyncTransport;
use super::types::{CombinedKey, ResourceKey, SyncTask};
use crate::membership::service::MembershipService;
use crate::naming::mapper::ResponsibilityMapper;
use crate::naming::store::EphemeralStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub struct SyncExecutor {
    membership: Arc<MembershipService>,
    mapper: Arc<ResponsibilityMapper>,
    store: Arc<EphemeralStore>,
    transport: Arc<dyn SyncTransport>,
    failure: FailureHandler,
    timeout: Duration,
}

impl SyncExecutor {
    pub fn new(
        membership: Arc<MembershipService>,
        mapper: Arc<ResponsibilityMapper>,
        store: Arc<EphemeralStore>,
        transport: Arc<dyn SyncTransport>,
        failure: FailureHandler,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            mapper,
            store,
            transport,
            failure,
            timeout,
        })
    }

    /// A key may be published while this node owns it, or while it still
    /// owes the new owner a handoff.
    pub fn is_authoritative(&self, key: &ResourceKey) -> bool {
        self.mapper.is_responsible(key) || self.store.is_handoff_pending(key)
    }

    fn publishable(&self, key: &CombinedKey) -> Vec<ResourceKey> {
        key.keys
            .iter()
            .filter(|resource_key| {
                let keep = self.is_authoritative(resource_key);
                if !keep {
                    tracing::debug!(
                        "Dropping {} from batch #{}: no longer owned locally",
                        resource_key,
                        key.sequence
                    );
                }
                keep
            })
            .cloned()
            .collect()
    }

    /// Ships one batch. Returns the number of keys delivered.
    pub async fn execute(&self, task: &SyncTask) -> Result<usize, SyncError> {
        let keys = self.publishable(&task.key);
        if keys.is_empty() {
            return Err(SyncError::StaleOwnership {
                sequence: task.key.sequence,
            });
        }

        let target = task.key.target();
        let peer = self
            .membership
            .get_member(target)
            .filter(|node| node.state.is_member())
            .ok_or_else(|| SyncError::PeerUnknown(target.clone()))?;

        let request = SyncRequest {
            source: self.membership.local_id().clone(),
            resource_type: task.key.resource_type(),
            action: task.action,
            sequence: task.key.sequence,
            snapshot: self.store.snapshot(&keys),
        };
        let payload = serde_json::to_vec(&request)?;

        match tokio::time::timeout(self.timeout, self.transport.push(&peer, payload)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SyncError::Timeout {
                    peer: peer.id.clone(),
                    timeout: self.timeout,
                });
            }
        }

        for key in &keys {
            if self.mapper.owner(key) == peer.id && self.store.complete_handoff(key) {
                tracing::info!("Handoff of {} to {} complete", key, peer.id);
            }
        }

        Ok(keys.len())
    }
}

#[async_trait]
impl SyncTaskProcessor for SyncExecutor {
    async fn process(&self, task: SyncTask) {
        match self.execute(&task).await {
            Ok(count) => {
                tracing::debug!(
                    "Synced batch #{} ({} keys, {:?}) to {}",
                    task.key.sequence,
                    count,
                    task.action,
                    task.key.target()
                );
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("{}", e);
                self.failure.retry(&task.key, task.action);
            }
            Err(e @ SyncError::Serialization(_)) => {
                tracing::error!("Dropping batch #{}: {}", task.key.sequence, e);
            }
            Err(e) => {
                tracing::debug!("Dropping batch #{}: {}", task.key.sequence, e);
            }
        }
    }
}
