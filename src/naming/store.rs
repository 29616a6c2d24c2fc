//! Local Ephemeral Store
//!
//! In-memory map of resource key -> current instance set. On the owner node
//! it is the authoritative copy; on every other node it holds the replica
//! last shipped by the owner.
//!
//! Every operation runs under the `DashMap` shard lock of its key, so a
//! snapshot of one key is always consistent with the latest completed write
//! to it. Nothing locks across keys.
//!
//! Local writes (`register`, `batch_register`, `deregister`) are owner
//! writes. The store remembers which instance ids it wrote for each key, and
//! an incoming snapshot never overrides those ids: a push that still carries
//! the previous owner's state is merged around them. The record is dropped
//! with `release_authored` once the key moves to another node.

use super::types::{Instance, now_ms};
use crate::distro::types::{ResourceKey, SyncAction};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct StoreEntry {
    /// instance_id -> instance
    instances: BTreeMap<String, Instance>,
    /// Set on the previous owner until the new owner acknowledged a sync.
    handoff_pending: bool,
}

impl StoreEntry {
    fn to_vec(&self) -> Vec<Instance> {
        self.instances.values().cloned().collect()
    }
}

/// Point-in-time state of a set of keys, as shipped to peers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: HashMap<ResourceKey, Vec<Instance>>,
    pub removed: Vec<ResourceKey>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.removed.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len() + self.removed.len()
    }
}

pub struct EphemeralStore {
    entries: DashMap<ResourceKey, StoreEntry>,
    /// key -> instance ids written locally, including removals.
    /// Locked after the `entries` guard of the same key, never before it.
    authored: DashMap<ResourceKey, HashSet<String>>,
}

impl EphemeralStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            authored: DashMap::new(),
        })
    }

    /// Upserts one instance. Returns the sync action to propagate, or `None`
    /// when the registration did not change replicated state.
    pub fn register(&self, key: &ResourceKey, instance: Instance) -> Option<SyncAction> {
        let mut instance = instance.normalized();
        instance.last_beat_ms = now_ms();

        let instance_id = instance.instance_id.clone();
        let action = {
            let mut entry = self.entries.entry(key.clone()).or_default();
            let action = match entry.instances.get(&instance_id) {
                None => Some(SyncAction::Add),
                Some(existing) if same_registration(existing, &instance) => None,
                Some(_) => Some(SyncAction::Change),
            };
            self.note_authored(key, [instance_id.clone()]);
            entry.instances.insert(instance_id, instance);
            action
        };
        action
    }

    /// Replaces every instance `session_id` contributed to `key` with
    /// `instances`. An empty list withdraws the session's contribution.
    pub fn batch_register(
        &self,
        key: &ResourceKey,
        session_id: &str,
        instances: Vec<Instance>,
    ) -> Option<SyncAction> {
        let beat = now_ms();
        let mut entry = self.entries.entry(key.clone()).or_default();
        let before = entry.instances.clone();
        let mut touched: Vec<String> = before
            .values()
            .filter(|existing| existing.session_id.as_deref() == Some(session_id))
            .map(|existing| existing.instance_id.clone())
            .collect();

        entry
            .instances
            .retain(|_, existing| existing.session_id.as_deref() != Some(session_id));
        for instance in instances {
            let mut instance = instance.normalized();
            instance.session_id = Some(session_id.to_string());
            instance.last_beat_ms = beat;
            touched.push(instance.instance_id.clone());
            entry.instances.insert(instance.instance_id.clone(), instance);
        }

        let changed = before.len() != entry.instances.len()
            || before.iter().any(|(id, old)| {
                entry
                    .instances
                    .get(id)
                    .map(|new| !same_registration(old, new))
                    .unwrap_or(true)
            });

        self.note_authored(key, touched);

        if entry.instances.is_empty() {
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.instances.is_empty());
            return if before.is_empty() {
                None
            } else {
                Some(SyncAction::Delete)
            };
        }

        match (changed, before.is_empty()) {
            (false, _) => None,
            (true, true) => Some(SyncAction::Add),
            (true, false) => Some(SyncAction::Change),
        }
    }

    /// Removes one instance; the key itself disappears with its last instance.
    /// With `session_id` set, an instance held by another session is left alone.
    pub fn deregister(
        &self,
        key: &ResourceKey,
        instance_id: &str,
        session_id: Option<&str>,
    ) -> Option<SyncAction> {
        let emptied = match self.entries.get_mut(key) {
            Some(mut entry) => {
                let holder = entry
                    .instances
                    .get(instance_id)
                    .map(|existing| existing.session_id.clone());
                match holder {
                    Some(holder) if session_id.is_some() && holder.as_deref() != session_id => {
                        tracing::debug!(
                            "Keeping {} on {}: held by session {:?}",
                            instance_id,
                            key,
                            holder
                        );
                        return None;
                    }
                    Some(_) => {
                        self.note_authored(key, [instance_id.to_string()]);
                        entry.instances.remove(instance_id);
                        Some(entry.instances.is_empty())
                    }
                    None => {
                        self.note_authored(key, [instance_id.to_string()]);
                        None
                    }
                }
            }
            None => {
                self.note_authored(key, [instance_id.to_string()]);
                None
            }
        };

        if emptied? {
            self.entries.remove_if(key, |_, entry| entry.instances.is_empty());
            Some(SyncAction::Delete)
        } else {
            Some(SyncAction::Change)
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Vec<Instance>> {
        self.entries.get(key).map(|entry| entry.to_vec())
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.value().instances.len())
            .sum()
    }

    /// Reads the current state of `keys`. Keys with no entry are reported as
    /// removed so the receiver drops its copy.
    pub fn snapshot(&self, keys: &[ResourceKey]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for key in keys {
            match self.entries.get(key) {
                Some(entry) => {
                    snapshot.entries.insert(key.clone(), entry.to_vec());
                }
                None => snapshot.removed.push(key.clone()),
            }
        }
        snapshot
    }

    /// Installs a full-state snapshot received from a peer. Each key is
    /// replaced wholesale, except for instance ids written locally, which
    /// keep their local state. Applying the same snapshot twice is a no-op.
    /// Returns the keys whose local state actually changed.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Vec<ResourceKey> {
        let mut changed = Vec::new();

        for (key, instances) in snapshot.entries {
            let incoming: BTreeMap<String, Instance> = instances
                .into_iter()
                .map(|instance| {
                    let instance = instance.normalized();
                    (instance.instance_id.clone(), instance)
                })
                .collect();
            if self.install(&key, incoming) {
                changed.push(key);
            }
        }

        for key in snapshot.removed {
            if self.install(&key, BTreeMap::new()) {
                changed.push(key);
            }
        }

        changed
    }

    fn install(&self, key: &ResourceKey, mut incoming: BTreeMap<String, Instance>) -> bool {
        let mut entry = self.entries.entry(key.clone()).or_default();
        let merged = match self.authored.get(key) {
            Some(authored) => {
                incoming.retain(|id, _| !authored.contains(id));
                for (id, instance) in &entry.instances {
                    if authored.contains(id) {
                        incoming.insert(id.clone(), instance.clone());
                    }
                }
                true
            }
            None => false,
        };

        if entry.instances == incoming {
            drop(entry);
            if incoming.is_empty() {
                self.entries.remove_if(key, |_, entry| entry.instances.is_empty());
            }
            return false;
        }
        if merged {
            tracing::debug!("Merged incoming state of {} around local writes", key);
        }
        entry.instances = incoming;

        if entry.instances.is_empty() {
            drop(entry);
            self.entries.remove_if(key, |_, entry| entry.instances.is_empty());
        }
        true
    }

    /// Forgets local writes of every key `still_owned` rejects, so snapshots
    /// from its new owner replace it wholesale again.
    pub fn release_authored(&self, still_owned: impl Fn(&ResourceKey) -> bool) {
        self.authored.retain(|key, _| still_owned(key));
    }

    pub fn is_authored(&self, key: &ResourceKey) -> bool {
        self.authored.contains_key(key)
    }

    fn note_authored(&self, key: &ResourceKey, ids: impl IntoIterator<Item = String>) {
        let mut ids = ids.into_iter().peekable();
        if ids.peek().is_none() {
            return;
        }
        self.authored.entry(key.clone()).or_default().extend(ids);
    }

    pub fn mark_handoff(&self, key: &ResourceKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.handoff_pending = true;
        }
    }

    /// Clears the handoff flag; `true` when a handoff was actually pending.
    pub fn complete_handoff(&self, key: &ResourceKey) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.handoff_pending => {
                entry.handoff_pending = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_handoff_pending(&self, key: &ResourceKey) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.handoff_pending)
            .unwrap_or(false)
    }
}

/// Equal for replication purposes; heartbeat timestamps are not replicated state.
fn same_registration(a: &Instance, b: &Instance) -> bool {
    let mut a = a.clone();
    a.last_beat_ms = b.last_beat_ms;
    &a == b
}
