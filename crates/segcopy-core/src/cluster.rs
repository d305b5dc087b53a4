//! Cluster membership and shard routing as seen by the copy services

use crate::shard::ShardId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// A node of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Node ID
    pub id: String,
    /// Transport address
    pub addr: SocketAddr,
}

impl DiscoveryNode {
    /// Create a node
    pub fn new(id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id: id.into(),
            addr,
        }
    }
}

/// Routing state of one shard copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRoutingState {
    /// Not allocated to any node
    Unassigned,
    /// Allocated, recovering
    Initializing,
    /// Allocated and serving
    Started,
    /// Moving to another node
    Relocating,
}

/// Routing entry of one shard copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    /// Shard
    pub shard_id: ShardId,
    /// Node holding this copy, if assigned
    pub node_id: Option<String>,
    /// Whether this copy is the primary
    pub primary: bool,
    /// Routing state
    pub state: ShardRoutingState,
}

impl ShardRouting {
    /// A started copy on `node_id`
    pub fn started(shard_id: ShardId, node_id: impl Into<String>, primary: bool) -> Self {
        Self {
            shard_id,
            node_id: Some(node_id.into()),
            primary,
            state: ShardRoutingState::Started,
        }
    }

    /// Whether the copy is allocated to a node
    pub fn assigned_to_node(&self) -> bool {
        self.node_id.is_some() && self.state != ShardRoutingState::Unassigned
    }
}

/// Primary plus the replicas it must keep in sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationGroup {
    /// Primary copy
    pub primary: ShardRouting,
    /// Replica copies
    pub replicas: Vec<ShardRouting>,
}

impl ReplicationGroup {
    /// Assigned replicas that do not live on the primary's node
    pub fn replication_targets(&self) -> Vec<&ShardRouting> {
        self.replicas
            .iter()
            .filter(|r| !r.primary && r.assigned_to_node())
            .filter(|r| r.node_id != self.primary.node_id)
            .collect()
    }

    /// Whether `node_id` still hosts a replica of this group
    pub fn has_replica_on(&self, node_id: &str) -> bool {
        self.replication_targets()
            .iter()
            .any(|r| r.node_id.as_deref() == Some(node_id))
    }
}

/// Read access to cluster membership and routing
pub trait ClusterView: Send + Sync {
    /// This node
    fn local_node(&self) -> DiscoveryNode;

    /// Resolve a node by ID
    fn node(&self, node_id: &str) -> Option<DiscoveryNode>;

    /// Replication group of a shard
    fn replication_group(&self, shard_id: &ShardId) -> Option<ReplicationGroup>;
}

/// Mutable in-memory cluster view
pub struct StaticClusterView {
    local: DiscoveryNode,
    nodes: RwLock<HashMap<String, DiscoveryNode>>,
    groups: RwLock<HashMap<ShardId, ReplicationGroup>>,
}

impl StaticClusterView {
    /// Create a view containing only the local node
    pub fn new(local: DiscoveryNode) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(local.id.clone(), local.clone());
        Self {
            local,
            nodes: RwLock::new(nodes),
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a node
    pub fn add_node(&self, node: DiscoveryNode) {
        self.nodes.write().insert(node.id.clone(), node);
    }

    /// Remove a node from membership
    pub fn remove_node(&self, node_id: &str) {
        self.nodes.write().remove(node_id);
    }

    /// Set the replication group of a shard
    pub fn set_replication_group(&self, group: ReplicationGroup) {
        self.groups
            .write()
            .insert(group.primary.shard_id.clone(), group);
    }

    /// Drop a replica from a shard's replication group
    pub fn remove_replica(&self, shard_id: &ShardId, node_id: &str) {
        if let Some(group) = self.groups.write().get_mut(shard_id) {
            group
                .replicas
                .retain(|r| r.node_id.as_deref() != Some(node_id));
        }
    }
}

impl ClusterView for StaticClusterView {
    fn local_node(&self) -> DiscoveryNode {
        self.local.clone()
    }

    fn node(&self, node_id: &str) -> Option<DiscoveryNode> {
        self.nodes.read().get(node_id).cloned()
    }

    fn replication_group(&self, shard_id: &ShardId) -> Option<ReplicationGroup> {
        self.groups.read().get(shard_id).cloned()
    }
}
