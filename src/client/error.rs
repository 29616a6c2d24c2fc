use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("RPC failed: {0}")]
    Rpc(String),

    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected to a registry node")]
    NotConnected,

    #[error("Server rejected request with status {0}")]
    Rejected(u16),
}

impl ClientError {
    /// The server no longer knows our session; only a reconnect helps.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, ClientError::Rejected(404) | ClientError::NotConnected)
    }
}
