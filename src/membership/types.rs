use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl NodeState {
    /// Suspect nodes still own their keys; only `Dead` takes a node out of the
    /// responsibility view.
    pub fn is_member(&self) -> bool {
        !matches!(self, NodeState::Dead)
    }
}

/// A registry server in the cluster.
///
/// `gossip_addr` carries the UDP membership traffic, `http_addr` the Distro
/// sync and naming endpoints. `incarnation` orders conflicting state claims
/// about the node (a node refutes a suspicion by bumping it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Node {
    pub fn new(id: NodeId, gossip_addr: SocketAddr, http_addr: SocketAddr) -> Self {
        Self {
            id,
            gossip_addr,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        }
    }

    pub fn silent_for(&self, now: Instant) -> Option<Duration> {
        self.last_seen.map(|seen| now.duration_since(seen))
    }
}

/// Change notifications published on the membership feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A node entered the responsibility view (new, or back from `Dead`).
    Joined(NodeId),
    /// A node was declared `Dead` and left the view.
    Left(NodeId),
}

/// UDP wire protocol between membership services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
        http_addr: SocketAddr,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },
}
