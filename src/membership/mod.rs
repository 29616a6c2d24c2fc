//! Membership & Discovery Module
//!
//! Gossip-based membership (inspired by SWIM) that maintains the cluster topology
//! and serves as the membership feed for ephemeral-data replication.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Nodes periodically exchange status updates via UDP.
//! - **Failure Detection**: "Suspect" -> "Dead" transitions driven by silence timeouts.
//! - **Incarnation Numbers**: Resolve disputed Alive/Suspect claims.
//! - **Membership Feed**: A sorted view of non-dead members plus `Joined`/`Left`
//!   events, consumed by `distro` for ownership and task cancellation.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
