//! Node Configuration
//!
//! Command line flags with environment fallbacks for a registry node. The
//! Distro knobs are a flattened group so tests and embedders can build a
//! `DistroConfig` directly.

use anyhow::Result;
use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "distro-node",
    about = "Ephemeral service registry node",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct ServerConfig {
    /// UDP address the membership gossip binds to.
    #[arg(long, env = "DISTRO_BIND")]
    pub bind: SocketAddr,

    /// Gossip address of an existing member; repeat for several seeds.
    #[arg(long = "seed", env = "DISTRO_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<SocketAddr>,

    /// The HTTP port is the gossip port plus this offset.
    #[arg(long, env = "DISTRO_HTTP_PORT_OFFSET", default_value_t = 1000)]
    pub http_port_offset: u16,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[command(flatten)]
    pub distro: DistroConfig,
}

impl ServerConfig {
    pub fn http_addr(&self) -> Result<SocketAddr> {
        let port = self
            .bind
            .port()
            .checked_add(self.http_port_offset)
            .ok_or_else(|| anyhow::anyhow!("HTTP port overflows for bind {}", self.bind))?;
        Ok(SocketAddr::new(self.bind.ip(), port))
    }
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct DistroConfig {
    /// Quiet period after the last merge before a pending batch fires.
    #[arg(long, env = "DISTRO_SYNC_DELAY_MS", default_value_t = 1000)]
    pub sync_delay_ms: u64,

    /// Delay before a split, failed key is attempted again.
    #[arg(long, env = "DISTRO_SYNC_RETRY_DELAY_MS", default_value_t = 3000)]
    pub sync_retry_delay_ms: u64,

    /// Batch size that makes a pending batch fire immediately.
    #[arg(long, env = "DISTRO_BATCH_SYNC_KEY_COUNT", default_value_t = 1000)]
    pub batch_sync_key_count: usize,

    /// Upper bound of one sync push before it counts as failed.
    #[arg(long, env = "DISTRO_SYNC_TIMEOUT_MS", default_value_t = 3000)]
    pub sync_timeout_ms: u64,

    #[arg(long, env = "DISTRO_TICK_INTERVAL_MS", default_value_t = 100)]
    pub tick_interval_ms: u64,

    /// Client sessions silent for longer than this are expired.
    #[arg(long, env = "DISTRO_SESSION_TIMEOUT_MS", default_value_t = 15000)]
    pub session_timeout_ms: u64,
}

impl Default for DistroConfig {
    fn default() -> Self {
        Self {
            sync_delay_ms: 1000,
            sync_retry_delay_ms: 3000,
            batch_sync_key_count: 1000,
            sync_timeout_ms: 3000,
            tick_interval_ms: 100,
            session_timeout_ms: 15000,
        }
    }
}

impl DistroConfig {
    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }

    pub fn sync_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sync_retry_delay_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_sync_key_count == 0 {
            return Err(anyhow::anyhow!("batch_sync_key_count must be at least 1"));
        }
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("tick_interval_ms must be positive"));
        }
        if self.sync_timeout_ms == 0 {
            return Err(anyhow::anyhow!("sync_timeout_ms must be positive"));
        }
        if self.sync_retry_delay_ms < self.sync_delay_ms {
            tracing::warn!(
                "sync_retry_delay_ms ({}) is shorter than sync_delay_ms ({})",
                self.sync_retry_delay_ms,
                self.sync_delay_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DistroConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let config = DistroConfig {
            batch_sync_key_count: 0,
            ..DistroConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_addr_uses_port_offset() {
        let config = ServerConfig::parse_from(["distro-node", "--bind", "127.0.0.1:5000"]);

        assert_eq!(config.http_addr().unwrap().port(), 6000);
        assert!(config.seeds.is_empty());
        assert_eq!(config.distro.sync_delay_ms, 1000);
    }

    #[test]
    fn test_seeds_and_knobs_parse() {
        let config = ServerConfig::parse_from([
            "distro-node",
            "--bind",
            "127.0.0.1:5001",
            "--seed",
            "127.0.0.1:5000",
            "--sync-delay-ms",
            "250",
            "--batch-sync-key-count",
            "10",
        ]);

        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.distro.sync_delay(), Duration::from_millis(250));
        assert_eq!(config.distro.batch_sync_key_count, 10);
    }
}
