use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast};
use tracing::info;

use super::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeState};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Gossip-based view of the registry cluster.
///
/// Besides running the SWIM-style probe loops it is the membership feed of
/// the Distro engine: `sorted_members` is the ordered view ownership is
/// computed from, and every change to that view bumps `version` and is
/// published to `subscribe()` receivers.
pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    version: AtomicU64,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipService {
    pub async fn new(
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        // Port 0 binds pick an ephemeral port; advertise the real one.
        let gossip_addr = socket.local_addr()?;
        let local_node = Node::new(NodeId::new(), gossip_addr, http_addr);

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            let encoded = bincode::serialize(&GossipMessage::Join {
                node: local_node.clone(),
            })?;
            for seed_node in seed_nodes.iter() {
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: Arc::new(RwLock::new(1)),
            version: AtomicU64::new(1),
            events,
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        let service = self.clone();
        tokio::spawn(async move {
            service.gossip_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.receive_loop().await;
        });

        let service = self.clone();
        tokio::spawn(async move {
            service.failure_detection_loop().await;
        });

        tracing::info!("All membership background tasks started");
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_node.id
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_member(&self, id: &NodeId) -> bool {
        self.members
            .get(id)
            .map(|entry| entry.value().state.is_member())
            .unwrap_or(false)
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Ids of every non-dead node, the local one included, sorted so that all
    /// nodes holding the same view agree on positions.
    pub fn sorted_members(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .members
            .iter()
            .filter(|entry| entry.value().state.is_member())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Non-dead nodes other than the local one.
    pub fn peers(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| {
                entry.key() != &self.local_node.id && entry.value().state.is_member()
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Monotonic counter bumped on every `MembershipEvent`.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Inserts or revives `node` and publishes `Joined` when it enters the view.
    pub fn admit(&self, mut node: Node) {
        node.last_seen = Some(Instant::now());
        let id = node.id.clone();

        let was_member = self
            .members
            .insert(id.clone(), node)
            .map(|previous| previous.state.is_member())
            .unwrap_or(false);

        if !was_member {
            tracing::info!("Node {} joined, cluster size now {}", id, self.sorted_members().len());
            self.publish(MembershipEvent::Joined(id));
        }
    }

    /// Declares `id` dead and publishes `Left` if it was part of the view.
    pub fn evict(&self, id: &NodeId) {
        if id == &self.local_node.id {
            return;
        }

        let left = match self.members.get_mut(id) {
            Some(mut member) if member.state.is_member() => {
                member.state = NodeState::Dead;
                true
            }
            _ => false,
        };

        if left {
            tracing::info!(
                "Node {} declared dead, cluster size now {}",
                id,
                self.sorted_members().len()
            );
            self.publish(MembershipEvent::Left(id.clone()));
        }
    }

    fn publish(&self, event: MembershipEvent) {
        self.version.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine; the view itself is always current.
        let _ = self.events.send(event);
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let targets: Vec<Node> = self
                .peers()
                .into_iter()
                .filter(|node| node.state == NodeState::Alive)
                .collect();

            if targets.is_empty() {
                continue;
            }

            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..targets.len());
            let target = &targets[idx];

            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation: *self.incarnation.read().await,
                http_addr: self.local_node.http_addr,
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.id, e);
                    } else {
                        tracing::trace!("Sent ping to {}", target.id);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling gossip from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize gossip from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping {
                from,
                incarnation,
                http_addr,
            } => self.handle_ping(from, incarnation, http_addr, src).await,
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
                Ok(())
            }
            GossipMessage::Join { node } => {
                tracing::info!("Node {} joining cluster at {}", node.id, node.gossip_addr);
                self.admit(node);
                Ok(())
            }
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => self.handle_suspect(node_id, incarnation).await,
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
                Ok(())
            }
        }
    }

    async fn handle_ping(
        &self,
        from: NodeId,
        from_incarnation: u64,
        http_addr: SocketAddr,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::trace!("Received ping from {}", from);

        let known = match self.members.get_mut(&from) {
            Some(mut member) if member.state.is_member() => {
                member.last_seen = Some(Instant::now());
                if from_incarnation > member.incarnation {
                    member.incarnation = from_incarnation;
                }
                true
            }
            _ => false,
        };

        if !known {
            tracing::info!("Discovered member {} via ping from {}", from, src);
            let mut node = Node::new(from.clone(), src, http_addr);
            node.incarnation = from_incarnation;
            self.admit(node);
        }

        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: *self.incarnation.read().await,
            members: self
                .members
                .iter()
                .map(|entry| entry.value().clone())
                .collect(),
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        Ok(())
    }

    fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        tracing::trace!(
            "Received ack from {} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, incoming: Node) {
        if incoming.id == self.local_node.id {
            return;
        }

        // Resolved under the entry guard, published after it is released.
        let mut event = None;

        match self.members.get_mut(&incoming.id) {
            Some(mut existing) => {
                let was_member = existing.state.is_member();

                if incoming.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {}: inc {} -> {}",
                        incoming.id,
                        existing.incarnation,
                        incoming.incarnation,
                    );
                    existing.state = incoming.state;
                    existing.incarnation = incoming.incarnation;
                    existing.http_addr = incoming.http_addr;
                    existing.last_seen = Some(Instant::now());
                } else if incoming.incarnation == existing.incarnation
                    && incoming.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{} refuted suspicion", incoming.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }

                match (was_member, existing.state.is_member()) {
                    (false, true) => event = Some(MembershipEvent::Joined(incoming.id.clone())),
                    (true, false) => event = Some(MembershipEvent::Left(incoming.id.clone())),
                    _ => {}
                }
            }
            None => {
                if incoming.state.is_member() {
                    tracing::info!(
                        "Discovered member {} at {}",
                        incoming.id,
                        incoming.gossip_addr
                    );
                    event = Some(MembershipEvent::Joined(incoming.id.clone()));
                }

                let mut node = incoming;
                node.last_seen = Some(Instant::now());
                self.members.insert(node.id.clone(), node);
            }
        }

        if let Some(event) = event {
            self.publish(event);
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        if node_id == self.local_node.id {
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                if incarnation < *inc {
                    return Ok(());
                }
                *inc = incarnation + 1;
                *inc
            };

            tracing::info!("Refuting suspicion with incarnation {}", my_incarnation);
            if let Some(mut me) = self.members.get_mut(&node_id) {
                me.incarnation = my_incarnation;
            }

            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: my_incarnation,
            })
            .await;
            return Ok(());
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive {
                    tracing::info!("Node {} suspected", existing.id);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            None => {
                tracing::debug!("Suspected node {} is unknown", node_id);
            }
        }

        Ok(())
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        let revived = match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                let was_member = existing.state.is_member();
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == NodeState::Suspect)
                {
                    tracing::info!("Node {} is alive (inc={})", existing.id, incarnation);
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
                !was_member && existing.state.is_member()
            }
            None => {
                tracing::debug!("Alive message for unknown node {}", node_id);
                false
            }
        };

        if revived {
            self.publish(MembershipEvent::Joined(node_id));
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut suspicions = Vec::new();
            let mut dead = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                let Some(elapsed) = member.silent_for(now) else {
                    member.last_seen = Some(now);
                    continue;
                };

                match member.state {
                    NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                        tracing::warn!("Node {} suspected (silent for {:?})", member.id, elapsed);
                        member.state = NodeState::Suspect;
                        suspicions.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        dead.push(member.id.clone());
                    }
                    _ => {}
                }
            }

            for id in dead {
                self.evict(&id);
            }

            for msg in suspicions {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize gossip broadcast: {}", e);
                return;
            }
        };

        for member in self.peers() {
            if member.state == NodeState::Alive
                && let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await
            {
                tracing::warn!("Failed to broadcast to {}: {}", member.id, e);
            }
        }
    }
}
