use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use std::sync::Arc;

use super::error::NamingError;
use super::protocol::{
    AckResponse, BatchInstanceRequest, BeatRequest, ConnectRequest, ConnectResponse,
    ForwardWriteRequest, InstanceRequest, InstancesResponse, SubscribeRequest,
};
use super::service::NamingService;
use super::types::ServiceKey;

fn ack(result: Result<(), NamingError>) -> (StatusCode, Json<AckResponse>) {
    match result {
        Ok(()) => (StatusCode::OK, Json(AckResponse::ok())),
        Err(e) => {
            tracing::warn!("Naming request failed: {}", e);
            (e.status(), Json(AckResponse::failed(e.to_string())))
        }
    }
}

pub async fn handle_connect(
    Extension(naming): Extension<Arc<NamingService>>,
    Json(req): Json<ConnectRequest>,
) -> (StatusCode, Json<ConnectResponse>) {
    let session_id = naming.connect(&req.namespace);
    (StatusCode::OK, Json(ConnectResponse { session_id }))
}

pub async fn handle_beat(
    Extension(naming): Extension<Arc<NamingService>>,
    Json(req): Json<BeatRequest>,
) -> (StatusCode, Json<AckResponse>) {
    match naming.beat(&req.session_id) {
        Ok(()) => (StatusCode::OK, Json(AckResponse::ok())),
        // Expected after a server restart or expiry; the client reconnects.
        Err(e) => (e.status(), Json(AckResponse::failed(e.to_string()))),
    }
}

pub async fn handle_register(
    Extension(naming): Extension<Arc<NamingService>>,
    Json(req): Json<InstanceRequest>,
) -> (StatusCode, Json<AckResponse>) {
    ack(naming
        .register(&req.session_id, req.service, req.instance)
        .await)
}

pub async fn handle_batch_register(
    Extension(naming): Extension<Arc<NamingService>>,
    Json(req): Json<BatchInstanceRequest>,
) -> (StatusCode, Json<AckResponse>) {
    ack(naming
        .batch_register(&req.session_id, req.service, req.instances)
        .await)
}

pub async fn handle_deregister(
    Extension(naming): Extension<Arc<NamingService>>,
    Json(req): Json<InstanceRequest>,
) -> (StatusCode, Json<AckResponse>) {
    ack(naming
        .deregister(&req.session_id, req.service, req.instance)
        .await)
}

pub async fn handle_subscribe(
    Extension(naming): Extension<Arc<NamingService>>,
    Json(req): Json<SubscribeRequest>,
) -> (StatusCode, Json<InstancesResponse>) {
    match naming.subscribe(&req.session_id, &req.service, &req.clusters) {
        Ok(instances) => (
            StatusCode::OK,
            Json(InstancesResponse {
                service: req.service,
                instances,
            }),
        ),
        Err(e) => {
            tracing::warn!("Subscribe failed: {}", e);
            (
                e.status(),
                Json(InstancesResponse {
                    service: req.service,
                    instances: Vec::new(),
                }),
            )
        }
    }
}

pub async fn handle_unsubscribe(
    Extension(naming): Extension<Arc<NamingService>>,
    Json(req): Json<SubscribeRequest>,
) -> (StatusCode, Json<AckResponse>) {
    ack(naming.unsubscribe(&req.session_id, &req.service, &req.clusters))
}

pub async fn handle_list_instances(
    Extension(naming): Extension<Arc<NamingService>>,
    Path(key_str): Path<String>,
) -> (StatusCode, Json<Option<InstancesResponse>>) {
    let service: ServiceKey = match key_str.parse() {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to parse service key: {}", e);
            return (StatusCode::BAD_REQUEST, Json(None));
        }
    };

    let instances = naming.list_instances(&service);
    (
        StatusCode::OK,
        Json(Some(InstancesResponse { service, instances })),
    )
}

/// Applies a write forwarded by a peer. Not forwarded again even if
/// ownership moved in the meantime.
pub async fn handle_forward_write(
    Extension(naming): Extension<Arc<NamingService>>,
    Json(req): Json<ForwardWriteRequest>,
) -> (StatusCode, Json<AckResponse>) {
    tracing::debug!(
        "Applying write on {} forwarded by {}",
        req.write.service(),
        req.origin
    );
    naming.apply_write(req.write);
    (StatusCode::OK, Json(AckResponse::ok()))
}
