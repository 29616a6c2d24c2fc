use axum::{Json, extract::Extension, http::StatusCode};
use std::sync::Arc;

use super::protocol::{SyncRequest, SyncResponse};
use super::service::DistroProtocol;

/// Receives a sync batch from a peer and installs it locally.
pub async fn handle_sync(
    Extension(distro): Extension<Arc<DistroProtocol>>,
    Json(req): Json<SyncRequest>,
) -> (StatusCode, Json<SyncResponse>) {
    tracing::debug!(
        "Received batch #{} ({:?}, {} key(s)) from {}",
        req.sequence,
        req.action,
        req.snapshot.key_count(),
        req.source
    );

    distro.on_receive(req);

    (StatusCode::OK, Json(SyncResponse { success: true }))
}
