use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of a naming client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// HTTP address of the registry node to connect to.
    pub server_addr: String,
    pub namespace: String,
    /// Period of the redo sweep.
    pub redo_sweep_period_ms: u64,
    /// Entries processed concurrently by one sweep.
    pub redo_concurrency: usize,
    pub rpc_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6000".to_string(),
            namespace: crate::naming::types::DEFAULT_NAMESPACE.to_string(),
            redo_sweep_period_ms: 3000,
            redo_concurrency: 8,
            rpc_timeout_ms: 3000,
            heartbeat_interval_ms: 5000,
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: &str) -> Self {
        Self {
            server_addr: server_addr.to_string(),
            ..Self::default()
        }
    }

    pub fn redo_sweep_period(&self) -> Duration {
        Duration::from_millis(self.redo_sweep_period_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(anyhow::anyhow!("server_addr must not be empty"));
        }
        if self.redo_sweep_period_ms == 0 {
            return Err(anyhow::anyhow!("redo_sweep_period_ms must be positive"));
        }
        if self.redo_concurrency == 0 {
            return Err(anyhow::anyhow!("redo_concurrency must be at least 1"));
        }
        if self.rpc_timeout_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(anyhow::anyhow!("rpc_timeout_ms and heartbeat_interval_ms must be positive"));
        }
        Ok(())
    }
}
