//! Naming Network Protocol
//!
//! Endpoints and DTOs of the client-facing naming API, plus the internal
//! forwarding call a node uses to hand a write to the key's owner.

use super::types::{Instance, ServiceKey};
use serde::{Deserialize, Serialize};

// --- API Endpoints ---

pub const ENDPOINT_CONNECT: &str = "/naming/connect";
pub const ENDPOINT_BEAT: &str = "/naming/beat";
pub const ENDPOINT_INSTANCE: &str = "/naming/instance";
pub const ENDPOINT_INSTANCE_BATCH: &str = "/naming/instance/batch";
pub const ENDPOINT_DEREGISTER: &str = "/naming/instance/deregister";
pub const ENDPOINT_SUBSCRIBE: &str = "/naming/subscribe";
pub const ENDPOINT_UNSUBSCRIBE: &str = "/naming/unsubscribe";
/// Followed by `/<namespace@@group@@service>`.
pub const ENDPOINT_INSTANCES: &str = "/naming/instances";
/// Internal endpoint a non-owner forwards writes to.
pub const ENDPOINT_FORWARD_WRITE: &str = "/internal/naming/write";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub namespace: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub session_id: String,
    pub service: ServiceKey,
    pub instance: Instance,
}

/// Replaces the whole set of instances the session holds for `service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInstanceRequest {
    pub session_id: String,
    pub service: ServiceKey,
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub session_id: String,
    pub service: ServiceKey,
    /// Comma separated cluster names; empty means all clusters.
    #[serde(default)]
    pub clusters: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub service: ServiceKey,
    pub instances: Vec<Instance>,
}

/// Generic acknowledgment for naming writes.
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// A store mutation, applied on the owner of `service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    Register {
        service: ServiceKey,
        instance: Instance,
    },
    BatchRegister {
        service: ServiceKey,
        session_id: String,
        instances: Vec<Instance>,
    },
    /// With `session_id` set, only removes the instance if that session
    /// still holds it.
    Deregister {
        service: ServiceKey,
        instance_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl WriteOp {
    pub fn service(&self) -> &ServiceKey {
        match self {
            WriteOp::Register { service, .. }
            | WriteOp::BatchRegister { service, .. }
            | WriteOp::Deregister { service, .. } => service,
        }
    }
}

/// Write forwarded by a node that does not own its key. Never forwarded again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardWriteRequest {
    /// Node that accepted the write from the client.
    pub origin: String,
    pub write: WriteOp,
}
