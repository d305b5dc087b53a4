//! Node configuration
//!
//! Loaded from a TOML file, then overridden by environment variables.
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, bail};
use segcopy_core::SegmentCopySettings;
use segcopy_core::shard::ShardId;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A member of the cluster
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Node ID
    pub id: String,
    /// Copy transport address
    pub addr: SocketAddr,
}

/// Placement of one shard
#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    /// Index name
    pub index: String,
    /// Shard number
    #[serde(default)]
    pub shard: u32,
    /// Node holding the primary
    pub primary: String,
    /// Nodes holding replicas
    #[serde(default)]
    pub replicas: Vec<String>,
}

impl ShardConfig {
    /// Shard id of this placement
    pub fn shard_id(&self) -> ShardId {
        ShardId::new(self.index.clone(), self.shard)
    }

    /// Whether `node_id` holds a copy of the shard
    pub fn is_hosted_on(&self, node_id: &str) -> bool {
        self.primary == node_id || self.replicas.iter().any(|r| r == node_id)
    }
}

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// ID of this node
    pub node_id: String,
    /// Address the copy server listens on
    pub bind_addr: SocketAddr,
    /// Root directory of the shard stores
    pub data_dir: PathBuf,
    /// How often primaries commit new files (ms)
    pub refresh_interval_ms: u64,
    /// Connect timeout for outbound copy connections (ms)
    pub connect_timeout_ms: u64,
    /// Cluster members
    pub peers: Vec<PeerConfig>,
    /// Shard placements
    pub shards: Vec<ShardConfig>,
    /// Segment copy settings
    pub copy: SegmentCopySettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9300)),
            data_dir: PathBuf::from("./data"),
            refresh_interval_ms: 1000,
            connect_timeout_ms: 5000,
            peers: Vec::new(),
            shards: Vec::new(),
            copy: SegmentCopySettings::default(),
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Invalid node configuration")
    }

    /// Load from `path`, or start from defaults when no file is given
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {:?}", path))?;
                let config = Self::from_toml(&content)?;
                tracing::info!("Loaded node configuration from {:?}", path);
                config
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (environment variables in production)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(node_id) = lookup("SEGCOPY_NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(addr) = lookup("SEGCOPY_BIND_ADDR") {
            self.bind_addr = addr
                .parse()
                .with_context(|| format!("Invalid SEGCOPY_BIND_ADDR {:?}", addr))?;
        }
        if let Some(dir) = lookup("SEGCOPY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.is_empty() {
            bail!("node_id must not be empty");
        }
        if self.refresh_interval_ms == 0 {
            bail!("refresh_interval_ms must be at least 1");
        }
        self.copy.validate()?;

        let mut members: HashSet<&str> = HashSet::from([self.node_id.as_str()]);
        for peer in self.remote_peers() {
            if !members.insert(peer.id.as_str()) {
                bail!("Node {} is configured twice", peer.id);
            }
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            let shard_id = shard.shard_id();
            if !seen.insert(shard_id.clone()) {
                bail!("Shard {} is placed twice", shard_id);
            }
            for node in std::iter::once(&shard.primary).chain(&shard.replicas) {
                if !members.contains(node.as_str()) {
                    bail!("Shard {} is placed on unknown node {}", shard_id, node);
                }
            }
            if shard.replicas.contains(&shard.primary) {
                bail!("Shard {} has a replica on its primary node", shard_id);
            }
        }
        Ok(())
    }

    /// Peers other than this node
    ///
    /// The member list may include the local node so one file can configure
    /// every member.
    pub fn remote_peers(&self) -> impl Iterator<Item = &PeerConfig> {
        self.peers.iter().filter(|p| p.id != self.node_id)
    }

    /// Interval between primary refreshes
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Connect timeout for outbound copy connections
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Store directory of a shard on this node
    pub fn shard_dir(&self, shard_id: &ShardId) -> PathBuf {
        self.data_dir
            .join(&shard_id.index)
            .join(shard_id.shard.to_string())
    }
}
