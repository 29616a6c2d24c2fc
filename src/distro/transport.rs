//! Push transport for sync batches.

use super::error::SyncError;
use super::protocol::ENDPOINT_DISTRO_SYNC;
use crate::membership::types::Node;

use async_trait::async_trait;
use std::time::Duration;

/// Ships one serialized `SyncRequest` to a peer. Must resolve to `Ok` only
/// when the peer acknowledged the batch.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, target: &Node, payload: Vec<u8>) -> Result<(), SyncError>;
}

/// JSON over HTTP POST to the peer's `ENDPOINT_DISTRO_SYNC`.
pub struct HttpSyncTransport {
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpSyncTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn push(&self, target: &Node, payload: Vec<u8>) -> Result<(), SyncError> {
        let url = format!("http://{}{}", target.http_addr, ENDPOINT_DISTRO_SYNC);

        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout {
                        peer: target.id.clone(),
                        timeout: self.timeout,
                    }
                } else {
                    SyncError::Transport {
                        peer: target.id.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(SyncError::Rejected {
                peer: target.id.clone(),
                status: response.status().as_u16(),
            });
        }

        Ok(())
    }
}
