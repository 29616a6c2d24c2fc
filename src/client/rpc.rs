//! Client RPC surface.

use super::error::ClientError;
use crate::naming::protocol::*;
use crate::naming::types::{Instance, ServiceKey};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Calls a naming client makes against a registry node. Every call resolves
/// to `Ok` only once the server acknowledged it.
#[async_trait]
pub trait NamingRpc: Send + Sync {
    /// Opens a session and returns its id.
    async fn connect(&self, namespace: &str) -> Result<String, ClientError>;

    async fn heartbeat(&self, session_id: &str) -> Result<(), ClientError>;

    async fn register(
        &self,
        session_id: &str,
        service: &ServiceKey,
        instance: &Instance,
    ) -> Result<(), ClientError>;

    async fn batch_register(
        &self,
        session_id: &str,
        service: &ServiceKey,
        instances: &[Instance],
    ) -> Result<(), ClientError>;

    async fn deregister(
        &self,
        session_id: &str,
        service: &ServiceKey,
        instance: &Instance,
    ) -> Result<(), ClientError>;

    async fn subscribe(
        &self,
        session_id: &str,
        service: &ServiceKey,
        clusters: &str,
    ) -> Result<Vec<Instance>, ClientError>;

    async fn unsubscribe(
        &self,
        session_id: &str,
        service: &ServiceKey,
        clusters: &str,
    ) -> Result<(), ClientError>;

    async fn list_instances(&self, service: &ServiceKey) -> Result<Vec<Instance>, ClientError>;
}

/// `NamingRpc` over the node's HTTP API.
pub struct HttpNamingClient {
    base_url: String,
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpNamingClient {
    pub fn new(server_addr: &str, timeout: Duration) -> Self {
        let base_url = if server_addr.starts_with("http://") || server_addr.starts_with("https://") {
            server_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", server_addr.trim_end_matches('/'))
        };

        Self {
            base_url,
            http_client: reqwest::Client::new(),
            timeout,
        }
    }

    fn map_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout(self.timeout)
        } else {
            ClientError::Rpc(e.to_string())
        }
    }

    async fn post<T, R>(&self, endpoint: &str, payload: &T) -> Result<R, ClientError>
    where
        T: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let response = self
            .http_client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Err(ClientError::Rejected(response.status().as_u16()));
        }

        response.json::<R>().await.map_err(|e| self.map_error(e))
    }

    async fn post_ack<T: Serialize + Sync>(&self, endpoint: &str, payload: &T) -> Result<(), ClientError> {
        let ack: AckResponse = self.post(endpoint, payload).await?;
        if ack.success {
            Ok(())
        } else {
            Err(ClientError::Rpc(
                ack.message.unwrap_or_else(|| "request not acknowledged".to_string()),
            ))
        }
    }
}

#[async_trait]
impl NamingRpc for HttpNamingClient {
    async fn connect(&self, namespace: &str) -> Result<String, ClientError> {
        let request = ConnectRequest {
            namespace: namespace.to_string(),
        };
        let response: ConnectResponse = self.post(ENDPOINT_CONNECT, &request).await?;
        Ok(response.session_id)
    }

    async fn heartbeat(&self, session_id: &str) -> Result<(), ClientError> {
        let request = BeatRequest {
            session_id: session_id.to_string(),
        };
        self.post_ack(ENDPOINT_BEAT, &request).await
    }

    async fn register(
        &self,
        session_id: &str,
        service: &ServiceKey,
        instance: &Instance,
    ) -> Result<(), ClientError> {
        let request = InstanceRequest {
            session_id: session_id.to_string(),
            service: service.clone(),
            instance: instance.clone(),
        };
        self.post_ack(ENDPOINT_INSTANCE, &request).await
    }

    async fn batch_register(
        &self,
        session_id: &str,
        service: &ServiceKey,
        instances: &[Instance],
    ) -> Result<(), ClientError> {
        let request = BatchInstanceRequest {
            session_id: session_id.to_string(),
            service: service.clone(),
            instances: instances.to_vec(),
        };
        self.post_ack(ENDPOINT_INSTANCE_BATCH, &request).await
    }

    async fn deregister(
        &self,
        session_id: &str,
        service: &ServiceKey,
        instance: &Instance,
    ) -> Result<(), ClientError> {
        let request = InstanceRequest {
            session_id: session_id.to_string(),
            service: service.clone(),
            instance: instance.clone(),
        };
        self.post_ack(ENDPOINT_DEREGISTER, &request).await
    }

    async fn subscribe(
        &self,
        session_id: &str,
        service: &ServiceKey,
        clusters: &str,
    ) -> Result<Vec<Instance>, ClientError> {
        let request = SubscribeRequest {
            session_id: session_id.to_string(),
            service: service.clone(),
            clusters: clusters.to_string(),
        };
        let response: InstancesResponse = self.post(ENDPOINT_SUBSCRIBE, &request).await?;
        Ok(response.instances)
    }

    async fn unsubscribe(
        &self,
        session_id: &str,
        service: &ServiceKey,
        clusters: &str,
    ) -> Result<(), ClientError> {
        let request = SubscribeRequest {
            session_id: session_id.to_string(),
            service: service.clone(),
            clusters: clusters.to_string(),
        };
        self.post_ack(ENDPOINT_UNSUBSCRIBE, &request).await
    }

    async fn list_instances(&self, service: &ServiceKey) -> Result<Vec<Instance>, ClientError> {
        let url = format!("{}{}/{}", self.base_url, ENDPOINT_INSTANCES, service);
        let response = self
            .http_client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Err(ClientError::Rejected(response.status().as_u16()));
        }

        let body: Option<InstancesResponse> =
            response.json().await.map_err(|e| self.map_error(e))?;
        Ok(body.map(|body| body.instances).unwrap_or_default())
    }
}
