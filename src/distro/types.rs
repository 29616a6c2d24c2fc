use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

/// Opaque identifier of one unit of replicable data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ResourceKey(pub String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of data a sync task carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Session-scoped service instance lists.
    EphemeralInstances,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::EphemeralInstances => f.write_str("ephemeral-instances"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncAction {
    Add,
    Change,
    Delete,
}

impl SyncAction {
    /// Folds the action of a merged task. The executor always ships the state
    /// present at fire time, so mixed batches are just a `Change`.
    pub fn merge(self, other: SyncAction) -> SyncAction {
        if self == other {
            self
        } else {
            SyncAction::Change
        }
    }
}

/// Sync work for one resource addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DistroKey {
    pub resource_key: ResourceKey,
    pub resource_type: ResourceType,
    pub target: NodeId,
}

impl DistroKey {
    pub fn new(resource_key: ResourceKey, resource_type: ResourceType, target: NodeId) -> Self {
        Self {
            resource_key,
            resource_type,
            target,
        }
    }

    pub fn bucket(&self) -> BucketKey {
        BucketKey {
            target: self.target.clone(),
            resource_type: self.resource_type,
        }
    }
}

impl fmt::Display for DistroKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -> {}", self.resource_type, self.resource_key, self.target)
    }
}

/// Coalescing bucket: everything pending for one `(peer, resource type)`.
/// Also the worker-affinity key, so at most one sync per bucket is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub target: NodeId,
    pub resource_type: ResourceType,
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.resource_type, self.target)
    }
}

/// A batch of resource keys of one type headed to one peer. `sequence`
/// distinguishes successive batches for the same bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedKey {
    pub bucket: BucketKey,
    pub keys: BTreeSet<ResourceKey>,
    pub sequence: u64,
}

impl CombinedKey {
    pub fn target(&self) -> &NodeId {
        &self.bucket.target
    }

    pub fn resource_type(&self) -> ResourceType {
        self.bucket.resource_type
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Splits the batch back into one `DistroKey` per resource.
    pub fn split(&self) -> Vec<DistroKey> {
        self.keys
            .iter()
            .map(|key| DistroKey::new(key.clone(), self.resource_type(), self.target().clone()))
            .collect()
    }
}

/// Pending combined sync task held by the delay engine.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub key: CombinedKey,
    pub action: SyncAction,
    pub due_time: Instant,
    pub last_merge_time: Instant,
    forced: bool,
}

impl SyncTask {
    pub fn new(bucket: BucketKey, sequence: u64, action: SyncAction, now: Instant) -> Self {
        Self {
            key: CombinedKey {
                bucket,
                keys: BTreeSet::new(),
                sequence,
            },
            action,
            due_time: now,
            last_merge_time: now,
            forced: false,
        }
    }

    /// Unions `resource_key` into the batch. The due time slides to
    /// `now + sync_delay` unless the batch reached `batch_size`; from then on
    /// the task stays due immediately.
    pub fn merge(
        &mut self,
        resource_key: ResourceKey,
        action: SyncAction,
        now: Instant,
        sync_delay: Duration,
        batch_size: usize,
    ) {
        self.action = if self.key.is_empty() {
            action
        } else {
            self.action.merge(action)
        };
        self.key.keys.insert(resource_key);
        self.last_merge_time = now;

        if self.key.len() >= batch_size {
            self.forced = true;
        }
        self.due_time = if self.forced {
            self.due_time.min(now)
        } else {
            now + sync_delay
        };
    }

    /// Makes the task eligible on the next tick regardless of later merges.
    pub fn force(&mut self, now: Instant) {
        self.forced = true;
        self.due_time = self.due_time.min(now);
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.due_time <= now
    }
}

/// Single-key retry produced by splitting a failed combined task.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub key: DistroKey,
    pub action: SyncAction,
    pub due_time: Instant,
}
