use crate::membership::types::NodeId;
use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NamingError {
    #[error("Unknown or expired session '{0}'")]
    UnknownSession(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Forwarding write to owner {owner} failed: {reason}")]
    Forward { owner: NodeId, reason: String },
}

impl NamingError {
    /// HTTP status a handler answers with. `404` tells clients to reconnect.
    pub fn status(&self) -> StatusCode {
        match self {
            NamingError::UnknownSession(_) => StatusCode::NOT_FOUND,
            NamingError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            NamingError::Forward { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
