//! Distro Wire Protocol
//!
//! A sync push carries the full current state of every key in the batch.
//! Receivers replace their copy wholesale, so duplicate or out-of-order
//! deliveries converge on the same state.

use super::types::{ResourceType, SyncAction};
use crate::membership::types::NodeId;
use crate::naming::store::Snapshot;
use serde::{Deserialize, Serialize};

/// Endpoint peers push sync batches to.
pub const ENDPOINT_DISTRO_SYNC: &str = "/distro/sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Node that produced the snapshot.
    pub source: NodeId,
    pub resource_type: ResourceType,
    pub action: SyncAction,
    /// Batch sequence number on the source, for tracing only.
    pub sequence: u64,
    pub snapshot: Snapshot,
}

/// Acknowledgment of a sync push. Any non-2xx status counts as a failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
}
