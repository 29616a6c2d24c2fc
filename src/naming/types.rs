use crate::distro::types::ResourceKey;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_NAMESPACE: &str = "public";
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";
pub const DEFAULT_CLUSTER: &str = "DEFAULT";
pub const KEY_SEPARATOR: &str = "@@";

/// Fully qualified service name. Its rendering is the `ResourceKey` the
/// service's instance list replicates under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub group: String,
    pub service: String,
}

impl ServiceKey {
    pub fn new(namespace: &str, group: &str, service: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            group: group.to_string(),
            service: service.to_string(),
        }
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey(self.to_string())
    }

    /// `group@@service`, the key client-side redo entries are stored under.
    pub fn grouped_name(&self) -> String {
        format!("{}{}{}", self.group, KEY_SEPARATOR, self.service)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.namespace,
            self.group,
            self.service,
            sep = KEY_SEPARATOR
        )
    }
}

impl FromStr for ServiceKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(KEY_SEPARATOR).collect();
        match parts.as_slice() {
            [namespace, group, service]
                if !namespace.is_empty() && !group.is_empty() && !service.is_empty() =>
            {
                Ok(Self::new(namespace, group, service))
            }
            _ => Err(anyhow::anyhow!(
                "Invalid service key '{}', expected namespace@@group@@service",
                s
            )),
        }
    }
}

impl TryFrom<&ResourceKey> for ServiceKey {
    type Error = anyhow::Error;

    fn try_from(key: &ResourceKey) -> Result<Self> {
        key.as_str().parse()
    }
}

/// One registered endpoint of a service.
///
/// `instance_id` (`ip#port#cluster`) identifies it within its service;
/// `session_id` is stamped by the server with the client session that
/// registered it, so the registration dies with the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    #[serde(default)]
    pub instance_id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub ephemeral: bool,
    #[serde(default = "default_cluster")]
    pub cluster_name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Millis timestamp of the last registration or heartbeat touching it.
    #[serde(default)]
    pub last_beat_ms: u64,
}

impl Instance {
    pub fn new(ip: &str, port: u16) -> Self {
        let mut instance = Self {
            instance_id: String::new(),
            ip: ip.to_string(),
            port,
            weight: default_weight(),
            healthy: true,
            enabled: true,
            ephemeral: true,
            cluster_name: default_cluster(),
            metadata: HashMap::new(),
            session_id: None,
            last_beat_ms: 0,
        };
        instance.instance_id = instance.generate_id();
        instance
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster_name = cluster.to_string();
        self.instance_id = self.generate_id();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn generate_id(&self) -> String {
        format!("{}#{}#{}", self.ip, self.port, self.cluster_name)
    }

    /// Fills in a missing id so lookups never depend on client discipline.
    pub fn normalized(mut self) -> Self {
        if self.instance_id.is_empty() {
            self.instance_id = self.generate_id();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ip.is_empty() {
            return Err(anyhow::anyhow!("Instance ip must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("Instance port must not be 0"));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(anyhow::anyhow!("Instance weight must be a non-negative number"));
        }
        Ok(())
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_cluster() -> String {
    DEFAULT_CLUSTER.to_string()
}

/// Current millis since the epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
