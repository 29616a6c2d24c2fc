//! HTTP router of a registry node.

use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use std::sync::Arc;

use crate::distro::handlers::handle_sync;
use crate::distro::protocol::ENDPOINT_DISTRO_SYNC;
use crate::distro::service::DistroProtocol;
use crate::naming::handlers::*;
use crate::naming::protocol::*;
use crate::naming::service::NamingService;

pub fn build_router(distro: Arc<DistroProtocol>, naming: Arc<NamingService>) -> Router {
    Router::new()
        .route(ENDPOINT_DISTRO_SYNC, post(handle_sync))
        .route(ENDPOINT_CONNECT, post(handle_connect))
        .route(ENDPOINT_BEAT, post(handle_beat))
        .route(ENDPOINT_INSTANCE, post(handle_register))
        .route(ENDPOINT_INSTANCE_BATCH, post(handle_batch_register))
        .route(ENDPOINT_DEREGISTER, post(handle_deregister))
        .route(ENDPOINT_SUBSCRIBE, post(handle_subscribe))
        .route(ENDPOINT_UNSUBSCRIBE, post(handle_unsubscribe))
        .route(
            &format!("{}/:service_key", ENDPOINT_INSTANCES),
            get(handle_list_instances),
        )
        .route(ENDPOINT_FORWARD_WRITE, post(handle_forward_write))
        .layer(Extension(distro))
        .layer(Extension(naming))
}
