//! Naming Service
//!
//! Client-facing write and read paths on top of the ephemeral store.
//!
//! A write is applied only on the owner of its service key. A node that
//! receives a write it does not own forwards it to the owner once; the owner
//! applies it to its store and hands the resulting change to Distro, which
//! publishes it to every peer. Reads are served from the local copy.

use super::error::NamingError;
use super::protocol::{ENDPOINT_FORWARD_WRITE, ForwardWriteRequest, WriteOp};
use super::sessions::{Session, SessionRegistry};
use super::types::{Instance, ServiceKey};
use crate::config::DistroConfig;
use crate::distro::service::DistroProtocol;
use crate::distro::types::SyncAction;
use crate::membership::{service::MembershipService, types::NodeId};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

const FORWARD_TIMEOUT: Duration = Duration::from_millis(1500);
const FORWARD_ATTEMPTS: usize = 3;

pub struct NamingService {
    membership: Arc<MembershipService>,
    distro: Arc<DistroProtocol>,
    sessions: Arc<SessionRegistry>,
    http_client: reqwest::Client,
    session_timeout: Duration,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl NamingService {
    pub fn new(
        membership: Arc<MembershipService>,
        distro: Arc<DistroProtocol>,
        sessions: Arc<SessionRegistry>,
        config: &DistroConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            distro,
            sessions,
            http_client: reqwest::Client::new(),
            session_timeout: config.session_timeout(),
            reaper: Mutex::new(None),
        })
    }

    /// Starts the session reaper.
    pub fn start(self: &Arc<Self>) {
        let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() {
            return;
        }

        let service = self.clone();
        let period = (self.session_timeout / 3).max(Duration::from_millis(10));
        *reaper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                service.expire_sessions().await;
            }
        }));

        tracing::info!("Session reaper started (timeout={:?})", self.session_timeout);
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn distro(&self) -> &Arc<DistroProtocol> {
        &self.distro
    }

    // --- Sessions ---

    pub fn connect(&self, namespace: &str) -> String {
        self.sessions.connect(namespace)
    }

    pub fn beat(&self, session_id: &str) -> Result<(), NamingError> {
        if self.sessions.touch(session_id) {
            Ok(())
        } else {
            Err(NamingError::UnknownSession(session_id.to_string()))
        }
    }

    /// Withdraws everything held by sessions that stopped beating.
    /// Returns the number of sessions expired.
    pub async fn expire_sessions(&self) -> usize {
        let expired = self.sessions.expire(self.session_timeout);
        let count = expired.len();

        for session in expired {
            tracing::info!(
                "Session {} expired, withdrawing {} registration(s)",
                session.id,
                session.registration_count()
            );
            self.withdraw(session).await;
        }
        count
    }

    async fn withdraw(&self, session: Session) {
        let mut writes = Vec::new();
        for (service, ids) in session.instances {
            for instance_id in ids {
                writes.push(WriteOp::Deregister {
                    service: service.clone(),
                    instance_id,
                    session_id: Some(session.id.clone()),
                });
            }
        }
        for service in session.batches {
            writes.push(WriteOp::BatchRegister {
                service,
                session_id: session.id.clone(),
                instances: Vec::new(),
            });
        }

        for write in writes {
            if let Err(e) = self.write(write).await {
                tracing::warn!("Failed to withdraw registration of session {}: {}", session.id, e);
            }
        }
    }

    // --- Client writes ---

    pub async fn register(
        &self,
        session_id: &str,
        service: ServiceKey,
        instance: Instance,
    ) -> Result<(), NamingError> {
        self.require_session(session_id)?;
        let mut instance = instance.normalized();
        instance
            .validate()
            .map_err(|e| NamingError::InvalidRequest(e.to_string()))?;
        instance.session_id = Some(session_id.to_string());
        let instance_id = instance.instance_id.clone();

        self.write(WriteOp::Register {
            service: service.clone(),
            instance,
        })
        .await?;

        // A session holds one single instance per service; a new one replaces it.
        let replaced: Vec<String> = self
            .sessions
            .get(session_id)
            .and_then(|session| session.instances.get(&service).cloned())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| *id != instance_id)
            .collect();
        for old_id in replaced {
            let withdrawn = self
                .write(WriteOp::Deregister {
                    service: service.clone(),
                    instance_id: old_id.clone(),
                    session_id: Some(session_id.to_string()),
                })
                .await;
            match withdrawn {
                Ok(()) => {
                    self.sessions.untrack_instance(session_id, &service, &old_id);
                }
                Err(e) => tracing::warn!("Failed to withdraw replaced instance {}: {}", old_id, e),
            }
        }

        self.sessions.track_instance(session_id, &service, &instance_id);
        Ok(())
    }

    pub async fn batch_register(
        &self,
        session_id: &str,
        service: ServiceKey,
        instances: Vec<Instance>,
    ) -> Result<(), NamingError> {
        self.require_session(session_id)?;
        for instance in &instances {
            instance
                .validate()
                .map_err(|e| NamingError::InvalidRequest(e.to_string()))?;
        }
        let active = !instances.is_empty();

        self.write(WriteOp::BatchRegister {
            service: service.clone(),
            session_id: session_id.to_string(),
            instances,
        })
        .await?;

        self.sessions.track_batch(session_id, &service, active);
        Ok(())
    }

    pub async fn deregister(
        &self,
        session_id: &str,
        service: ServiceKey,
        instance: Instance,
    ) -> Result<(), NamingError> {
        self.require_session(session_id)?;
        let instance_id = instance.normalized().instance_id;

        self.write(WriteOp::Deregister {
            service: service.clone(),
            instance_id: instance_id.clone(),
            session_id: Some(session_id.to_string()),
        })
        .await?;

        self.sessions.untrack_instance(session_id, &service, &instance_id);
        Ok(())
    }

    /// Records the subscription and returns the currently known instances.
    pub fn subscribe(
        &self,
        session_id: &str,
        service: &ServiceKey,
        clusters: &str,
    ) -> Result<Vec<Instance>, NamingError> {
        if !self.sessions.subscribe(session_id, service, clusters) {
            return Err(NamingError::UnknownSession(session_id.to_string()));
        }
        tracing::debug!("Session {} subscribed to {} [{}]", session_id, service, clusters);
        Ok(self.filtered_instances(service, clusters))
    }

    pub fn unsubscribe(
        &self,
        session_id: &str,
        service: &ServiceKey,
        clusters: &str,
    ) -> Result<(), NamingError> {
        if !self.sessions.unsubscribe(session_id, service, clusters) {
            return Err(NamingError::UnknownSession(session_id.to_string()));
        }
        tracing::debug!("Session {} unsubscribed from {} [{}]", session_id, service, clusters);
        Ok(())
    }

    // --- Reads ---

    pub fn list_instances(&self, service: &ServiceKey) -> Vec<Instance> {
        self.distro
            .store()
            .get(&service.resource_key())
            .unwrap_or_default()
    }

    fn filtered_instances(&self, service: &ServiceKey, clusters: &str) -> Vec<Instance> {
        let wanted: Vec<&str> = clusters
            .split(',')
            .map(str::trim)
            .filter(|cluster| !cluster.is_empty())
            .collect();

        self.list_instances(service)
            .into_iter()
            .filter(|instance| wanted.is_empty() || wanted.contains(&instance.cluster_name.as_str()))
            .collect()
    }

    // --- Write routing ---

    /// Applies `write` locally when this node owns its key, otherwise
    /// forwards it to the owner.
    pub async fn write(&self, write: WriteOp) -> Result<(), NamingError> {
        let key = write.service().resource_key();
        let owner = self.distro.mapper().owner(&key);

        if &owner == self.membership.local_id() {
            self.apply_write(write);
            return Ok(());
        }

        self.forward_write(&owner, write).await
    }

    /// Mutates the local store and schedules the sync of the change.
    /// Returns the action published, `None` when nothing changed.
    pub fn apply_write(&self, write: WriteOp) -> Option<SyncAction> {
        let store = self.distro.store();
        let key = write.service().resource_key();

        let action = match write {
            WriteOp::Register { instance, .. } => store.register(&key, instance),
            WriteOp::BatchRegister {
                session_id,
                instances,
                ..
            } => store.batch_register(&key, &session_id, instances),
            WriteOp::Deregister {
                instance_id,
                session_id,
                ..
            } => store.deregister(&key, &instance_id, session_id.as_deref()),
        }?;

        let peers = self.distro.sync(&key, action);
        tracing::debug!("Applied {:?} on {}, syncing to {} peer(s)", action, key, peers);
        Some(action)
    }

    async fn forward_write(&self, owner: &NodeId, write: WriteOp) -> Result<(), NamingError> {
        let node = self
            .membership
            .get_member(owner)
            .ok_or_else(|| NamingError::Forward {
                owner: owner.clone(),
                reason: "owner not found".to_string(),
            })?;

        let payload = ForwardWriteRequest {
            origin: self.membership.local_id().to_string(),
            write,
        };
        let url = format!("http://{}{}", node.http_addr, ENDPOINT_FORWARD_WRITE);

        let response = self
            .post_with_retry(url, &payload)
            .await
            .map_err(|e| NamingError::Forward {
                owner: owner.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(NamingError::Forward {
                owner: owner.clone(),
                reason: format!("status {}", response.status()),
            });
        }

        tracing::debug!("Forwarded write on {} to {}", payload.write.service(), owner);
        Ok(())
    }

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
    ) -> anyhow::Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..FORWARD_ATTEMPTS {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(FORWARD_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == FORWARD_ATTEMPTS {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }

    fn require_session(&self, session_id: &str) -> Result<(), NamingError> {
        if self.sessions.touch(session_id) {
            Ok(())
        } else {
            Err(NamingError::UnknownSession(session_id.to_string()))
        }
    }
}
