//! Distro Protocol
//!
//! Wires the store, responsibility mapper, delay engine and executor together
//! and reacts to the membership feed:
//!
//! - **Writes**: every accepted local write is published to all peers.
//! - **Receive**: incoming snapshots are installed; a key this node now owns
//!   that changed on receipt (a handoff) is re-published to the other peers.
//!   Instances this node already wrote as owner keep their local state, so a
//!   late handoff push cannot roll them back.
//! - **Rebalance**: on a view change, departed peers lose their tasks, keys
//!   moving away are handed off to their new owner (old copy kept and served
//!   until the handoff is acknowledged), keys moving here are re-published,
//!   and new peers are seeded with every key this node still owns.

use super::delay::DelayTaskEngine;
use super::executor::SyncExecutor;
use super::failure::FailureHandler;
use super::protocol::SyncRequest;
use super::transport::SyncTransport;
use super::types::{DistroKey, ResourceKey, ResourceType, SyncAction};
use crate::config::DistroConfig;
use crate::membership::service::MembershipService;
use crate::membership::types::{MembershipEvent, NodeId};
use crate::naming::mapper::ResponsibilityMapper;
use crate::naming::store::EphemeralStore;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

pub struct DistroProtocol {
    membership: Arc<MembershipService>,
    mapper: Arc<ResponsibilityMapper>,
    store: Arc<EphemeralStore>,
    engine: Arc<DelayTaskEngine>,
    executor: Arc<SyncExecutor>,
    /// Membership view the current ownership was last computed from.
    view: Mutex<Vec<NodeId>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DistroProtocol {
    pub fn new(
        membership: Arc<MembershipService>,
        mapper: Arc<ResponsibilityMapper>,
        store: Arc<EphemeralStore>,
        transport: Arc<dyn SyncTransport>,
        config: &DistroConfig,
    ) -> Arc<Self> {
        let engine = DelayTaskEngine::new(config);
        let executor = SyncExecutor::new(
            membership.clone(),
            mapper.clone(),
            store.clone(),
            transport,
            FailureHandler::new(engine.clone()),
            config.sync_timeout(),
        );

        Arc::new(Self {
            view: Mutex::new(mapper.view()),
            membership,
            mapper,
            store,
            engine,
            executor,
            listener: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        self.engine.start(self.executor.clone());

        let events = self.membership.subscribe();
        // Catch up with anything that changed between construction and subscribing.
        self.refresh_view();

        let protocol = self.clone();
        let handle = tokio::spawn(async move {
            protocol.membership_loop(events).await;
        });
        if let Some(previous) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }

        tracing::info!("Distro protocol started on {}", self.mapper.local_id());
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.engine.stop();
        tracing::info!("Distro protocol stopped");
    }

    pub fn engine(&self) -> &Arc<DelayTaskEngine> {
        &self.engine
    }

    pub fn executor(&self) -> &Arc<SyncExecutor> {
        &self.executor
    }

    pub fn store(&self) -> &Arc<EphemeralStore> {
        &self.store
    }

    pub fn mapper(&self) -> &Arc<ResponsibilityMapper> {
        &self.mapper
    }

    /// Enqueues `key` for every peer. Returns the number of tasks added.
    pub fn sync(&self, key: &ResourceKey, action: SyncAction) -> usize {
        self.sync_except(key, action, None)
    }

    pub fn sync_to(&self, key: &ResourceKey, action: SyncAction, peer: &NodeId) {
        self.engine.add_task(
            DistroKey::new(key.clone(), ResourceType::EphemeralInstances, peer.clone()),
            action,
        );
    }

    fn sync_except(&self, key: &ResourceKey, action: SyncAction, except: Option<&NodeId>) -> usize {
        let mut added = 0;
        for peer in self.membership.peers() {
            if Some(&peer.id) == except {
                continue;
            }
            self.sync_to(key, action, &peer.id);
            added += 1;
        }
        added
    }

    /// Installs a snapshot pushed by a peer. Returns how many keys changed.
    pub fn on_receive(&self, request: SyncRequest) -> usize {
        let source = request.source;
        let changed = self.store.apply_snapshot(request.snapshot);

        for key in &changed {
            if self.mapper.is_responsible(key) {
                if self.store.is_authored(key) {
                    tracing::info!("Merged late push of {} from {}, re-publishing", key, source);
                } else {
                    tracing::info!("Took over {} from {}, re-publishing", key, source);
                }
                self.sync_except(key, SyncAction::Change, Some(&source));
            }
        }

        tracing::debug!(
            "Applied batch #{} from {}: {} key(s) changed",
            request.sequence,
            source,
            changed.len()
        );
        changed.len()
    }

    /// Recomputes ownership against the current membership view and
    /// schedules whatever the change requires.
    pub fn refresh_view(&self) {
        let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
        let new_view = self.mapper.view();
        if *view == new_view {
            return;
        }

        let old_view = std::mem::replace(&mut *view, new_view);
        self.rebalance(&old_view, &view);
    }

    fn rebalance(&self, old_view: &[NodeId], new_view: &[NodeId]) {
        let me = self.mapper.local_id().clone();
        let old_members: HashSet<&NodeId> = old_view.iter().collect();
        let new_members: HashSet<&NodeId> = new_view.iter().collect();

        for departed in old_members.difference(&new_members) {
            self.engine.remove_peer(departed);
        }
        let joined: Vec<&NodeId> = new_members
            .difference(&old_members)
            .filter(|id| **id != &me)
            .copied()
            .collect();

        let (mut handoffs, mut takeovers, mut seeded) = (0usize, 0usize, 0usize);

        for key in self.store.keys() {
            let old_owner = ResponsibilityMapper::owner_in(old_view, &key).unwrap_or_else(|| me.clone());
            let new_owner = ResponsibilityMapper::owner_in(new_view, &key).unwrap_or_else(|| me.clone());

            if new_owner == me {
                self.store.complete_handoff(&key);
                if old_owner != me {
                    self.sync(&key, SyncAction::Change);
                    takeovers += 1;
                } else {
                    for peer in &joined {
                        self.sync_to(&key, SyncAction::Change, peer);
                        seeded += 1;
                    }
                }
            } else if old_owner == me || self.store.is_handoff_pending(&key) {
                self.store.mark_handoff(&key);
                self.sync_to(&key, SyncAction::Change, &new_owner);
                handoffs += 1;
            }
        }
        self.store.release_authored(|key| {
            ResponsibilityMapper::owner_in(new_view, key).is_none_or(|owner| owner == me)
        });

        tracing::info!(
            "Membership view changed ({} -> {} members): {} handoff(s), {} takeover(s), {} seed task(s)",
            old_view.len(),
            new_view.len(),
            handoffs,
            takeovers,
            seeded
        );
    }

    async fn membership_loop(self: Arc<Self>, mut events: broadcast::Receiver<MembershipEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::debug!("Membership event: {:?}", event);
                    self.refresh_view();
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Missed {} membership event(s), recomputing view", missed);
                    self.refresh_view();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
