//! Client Redo State
//!
//! The client remembers every registration and subscription it intends to
//! hold, next to what the server last confirmed. The difference between the
//! two, derived on every read, tells the redo sweep what is left to do:
//!
//! | registered | unregistering | expected_registered | RedoType   |
//! |------------|---------------|---------------------|------------|
//! | true       | false         | true                | None       |
//! | true       | false         | false               | Unregister |
//! | true       | true          | any                 | Unregister |
//! | false      | false         | true                | Register   |
//! | false      | false         | false               | None       |
//! | false      | true          | true                | Register   |
//! | false      | true          | false               | Remove     |
//!
//! Entries sit behind a per-key async mutex. The caller path and the sweep
//! both hold it for the whole mutate-RPC-ack sequence, so one key never has
//! two operations in flight.

use crate::naming::types::{Instance, KEY_SEPARATOR, ServiceKey};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoType {
    None,
    Register,
    Unregister,
    Remove,
}

impl RedoType {
    pub fn derive(registered: bool, unregistering: bool, expected_registered: bool) -> Self {
        match (registered, unregistering, expected_registered) {
            (true, false, true) => RedoType::None,
            (true, false, false) => RedoType::Unregister,
            (true, true, _) => RedoType::Unregister,
            (false, false, true) => RedoType::Register,
            (false, false, false) => RedoType::None,
            (false, true, true) => RedoType::Register,
            (false, true, false) => RedoType::Remove,
        }
    }
}

/// What an instance redo entry registers.
#[derive(Debug, Clone, PartialEq)]
pub enum InstancePayload {
    Single(Instance),
    /// Replaces everything the session holds for the service.
    Batch(Vec<Instance>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionPayload {
    pub clusters: String,
}

#[derive(Debug, Clone)]
pub struct RedoEntry<T> {
    pub service_name: String,
    pub group_name: String,
    pub payload: T,
    pub expected_registered: bool,
    pub registered: bool,
    pub unregistering: bool,
    /// Set when the entry is dropped from its table. Holders of a stale
    /// handle must look the key up again.
    removed: bool,
}

impl<T> RedoEntry<T> {
    pub fn new(service_name: &str, group_name: &str, payload: T) -> Self {
        Self {
            service_name: service_name.to_string(),
            group_name: group_name.to_string(),
            payload,
            expected_registered: false,
            registered: false,
            unregistering: false,
            removed: false,
        }
    }

    pub fn redo_type(&self) -> RedoType {
        RedoType::derive(self.registered, self.unregistering, self.expected_registered)
    }

    pub fn is_need_redo(&self) -> bool {
        self.redo_type() != RedoType::None
    }

    pub fn service_key(&self, namespace: &str) -> ServiceKey {
        ServiceKey::new(namespace, &self.group_name, &self.service_name)
    }

    /// Caller wants the entry gone.
    pub fn set_deregister_intent(&mut self) {
        self.expected_registered = false;
        self.unregistering = true;
    }

    /// The server confirmed a register. The entry lock is held from the
    /// intent through the ack, so the ack always answers the latest intent.
    pub fn register_acked(&mut self) {
        self.registered = true;
        self.unregistering = false;
    }

    /// The server confirmed a deregister.
    pub fn deregister_acked(&mut self) {
        self.registered = false;
    }

    /// A new transport session holds none of our registrations.
    pub fn reset_registered(&mut self) {
        self.registered = false;
    }
}

impl<T: PartialEq> RedoEntry<T> {
    /// Caller wants the entry registered with `payload`. A payload different
    /// from the confirmed one has to be sent again.
    pub fn set_register_intent(&mut self, payload: T) {
        if self.payload != payload {
            self.registered = false;
            self.payload = payload;
        }
        self.expected_registered = true;
    }
}

type Shared<T> = Arc<Mutex<RedoEntry<T>>>;

/// One kind of redo entry, keyed by name.
pub struct RedoTable<T> {
    entries: DashMap<String, Shared<T>>,
}

impl<T: PartialEq + Send + 'static> RedoTable<T> {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Locks the entry for `key`, creating it with `init` when absent.
    pub async fn acquire(
        &self,
        key: &str,
        init: impl Fn() -> RedoEntry<T>,
    ) -> OwnedMutexGuard<RedoEntry<T>> {
        loop {
            let shared = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(init())))
                .clone();
            let guard = shared.lock_owned().await;
            if !guard.removed {
                return guard;
            }
        }
    }

    /// Locks the entry for `key` if there is one.
    pub async fn acquire_existing(&self, key: &str) -> Option<OwnedMutexGuard<RedoEntry<T>>> {
        loop {
            let shared = self.entries.get(key)?.value().clone();
            let guard = shared.lock_owned().await;
            if !guard.removed {
                return Some(guard);
            }
        }
    }

    /// Drops the entry whose lock `guard` holds. A live entry is always the
    /// one in the table, so removing by key cannot hit a newer entry.
    pub fn remove(&self, key: &str, guard: &mut RedoEntry<T>) {
        guard.removed = true;
        self.entries.remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn redo_type(&self, key: &str) -> Option<RedoType> {
        self.acquire_existing(key).await.map(|entry| entry.redo_type())
    }

    async fn reset_registered(&self) {
        let shared: Vec<Shared<T>> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for entry in shared {
            entry.lock().await.reset_registered();
        }
    }
}

/// Every redo entry of one client.
pub struct RedoRegistry {
    pub instances: RedoTable<InstancePayload>,
    pub subscriptions: RedoTable<SubscriptionPayload>,
}

impl RedoRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            instances: RedoTable::new(),
            subscriptions: RedoTable::new(),
        })
    }

    /// Key of the instance entry of a service: `group@@service`.
    pub fn instance_key(service_name: &str, group_name: &str) -> String {
        format!("{}{}{}", group_name, KEY_SEPARATOR, service_name)
    }

    /// Key of a subscription entry: `group@@service@@clusters`.
    pub fn subscription_key(service_name: &str, group_name: &str, clusters: &str) -> String {
        format!(
            "{}{sep}{}",
            Self::instance_key(service_name, group_name),
            clusters,
            sep = KEY_SEPARATOR
        )
    }

    /// Called when the client got a session different from the previous one:
    /// nothing is registered on the new session yet.
    pub async fn on_new_session(&self) {
        self.instances.reset_registered().await;
        self.subscriptions.reset_registered().await;
        tracing::info!(
            "New session, marked {} instance and {} subscription entries for redo",
            self.instances.len(),
            self.subscriptions.len()
        );
    }

    pub fn len(&self) -> usize {
        self.instances.len() + self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.subscriptions.is_empty()
    }
}
