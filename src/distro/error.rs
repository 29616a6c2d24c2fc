use crate::membership::types::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Why a sync attempt did not complete. The variant decides the task's fate:
/// transport-level failures are retried, the rest drop the batch.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync to {peer} timed out after {timeout:?}")]
    Timeout { peer: NodeId, timeout: Duration },

    #[error("Sync to {peer} failed: {reason}")]
    Transport { peer: NodeId, reason: String },

    #[error("Peer {peer} rejected sync with status {status}")]
    Rejected { peer: NodeId, status: u16 },

    #[error("Failed to serialize sync payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No key in batch #{sequence} is still owned locally")]
    StaleOwnership { sequence: u64 },

    #[error("Peer {0} is not a cluster member")]
    PeerUnknown(NodeId),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout { .. } | SyncError::Transport { .. } | SyncError::Rejected { .. }
        )
    }
}
