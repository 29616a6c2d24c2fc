//! Client Sessions
//!
//! Every client connects once and gets a session id; all of its ephemeral
//! registrations and subscriptions hang off that session. Sessions live on
//! the node the client is connected to and are kept alive by heartbeats.
//! When a session goes silent for longer than the session timeout it is
//! expired and everything it registered is withdrawn.

use super::types::ServiceKey;

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub namespace: String,
    pub last_beat: Instant,
    /// service -> instance ids registered one by one
    pub instances: HashMap<ServiceKey, HashSet<String>>,
    /// services this session holds a batch registration for
    pub batches: HashSet<ServiceKey>,
    /// service -> cluster filters subscribed to, one per subscription
    pub subscriptions: HashMap<ServiceKey, HashSet<String>>,
}

impl Session {
    fn new(namespace: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.to_string(),
            last_beat: Instant::now(),
            instances: HashMap::new(),
            batches: HashSet::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn registration_count(&self) -> usize {
        self.instances.values().map(HashSet::len).sum::<usize>() + self.batches.len()
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
        })
    }

    /// Opens a new session and returns its id.
    pub fn connect(&self, namespace: &str) -> String {
        let session = Session::new(namespace);
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        tracing::info!("Client session {} connected (namespace={})", id, namespace);
        id
    }

    /// Records a heartbeat. `false` when the session is unknown.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.last_beat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|session| session.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn track_instance(&self, session_id: &str, service: &ServiceKey, instance_id: &str) -> bool {
        self.with_session(session_id, |session| {
            session
                .instances
                .entry(service.clone())
                .or_default()
                .insert(instance_id.to_string());
        })
    }

    pub fn untrack_instance(&self, session_id: &str, service: &ServiceKey, instance_id: &str) -> bool {
        self.with_session(session_id, |session| {
            if let Some(ids) = session.instances.get_mut(service) {
                ids.remove(instance_id);
                if ids.is_empty() {
                    session.instances.remove(service);
                }
            }
        })
    }

    /// Tracks (`active`) or forgets the batch registration of `service`.
    pub fn track_batch(&self, session_id: &str, service: &ServiceKey, active: bool) -> bool {
        self.with_session(session_id, |session| {
            if active {
                session.batches.insert(service.clone());
            } else {
                session.batches.remove(service);
            }
        })
    }

    pub fn subscribe(&self, session_id: &str, service: &ServiceKey, clusters: &str) -> bool {
        self.with_session(session_id, |session| {
            session
                .subscriptions
                .entry(service.clone())
                .or_default()
                .insert(clusters.to_string());
        })
    }

    /// Drops the subscription of `service` under the `clusters` filter; other
    /// filters on the same service stay.
    pub fn unsubscribe(&self, session_id: &str, service: &ServiceKey, clusters: &str) -> bool {
        self.with_session(session_id, |session| {
            if let Some(filters) = session.subscriptions.get_mut(service) {
                filters.remove(clusters);
                if filters.is_empty() {
                    session.subscriptions.remove(service);
                }
            }
        })
    }

    /// Removes and returns every session silent for longer than `timeout`.
    pub fn expire(&self, timeout: Duration) -> Vec<Session> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|session| now.duration_since(session.last_beat) > timeout)
            .map(|session| session.key().clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                self.sessions
                    .remove_if(&id, |_, session| now.duration_since(session.last_beat) > timeout)
                    .map(|(_, session)| session)
            })
            .collect()
    }

    fn with_session(&self, session_id: &str, f: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                f(&mut session);
                true
            }
            None => false,
        }
    }
}
