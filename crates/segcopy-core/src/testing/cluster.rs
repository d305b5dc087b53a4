//! In-process multi-node cluster for copy tests
//!
//! Every node gets its own [`IndicesService`], source service and target
//! service, all wired to one [`LocalNetwork`]. Each node has its own cluster
//! view (they differ in the local node) but routing changes are applied to
//! all of them at once.

use super::context::TestContext;
use super::fixtures::{segment_shard, test_node};
use crate::cluster::{ReplicationGroup, ShardRouting, StaticClusterView};
use crate::config::SegmentCopySettings;
use crate::shard::{IndexShard, IndicesService, ShardId};
use crate::source::SegmentsCopySourceService;
use crate::store::ShardStore;
use crate::target::SegmentsCopyTargetService;
use crate::transport::LocalNetwork;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One simulated node
pub struct TestNode {
    /// Node ID
    pub id: String,
    /// Local shards
    pub indices: Arc<IndicesService>,
    /// Outbound copy service
    pub source: Arc<SegmentsCopySourceService>,
    /// Inbound copy service
    pub target: Arc<SegmentsCopyTargetService>,
    /// This node's view of the cluster
    pub view: Arc<StaticClusterView>,
}

/// Nodes sharing one [`LocalNetwork`]
///
/// # Example
///
/// ```rust,no_run
/// use segcopy_core::config::SegmentCopySettings;
/// use segcopy_core::shard::ShardId;
/// use segcopy_core::testing::TestCluster;
///
/// # async fn example() {
/// let cluster = TestCluster::new(&["n1", "n2"], SegmentCopySettings::default());
/// let shard = ShardId::new("logs", 0);
/// cluster.add_shard(&shard, "n1", &["n2"]);
/// cluster.commit(&shard, &[("_0.cfs", b"data")]);
/// cluster.drive();
/// assert!(cluster.wait_for_version("n2", &shard, 1, std::time::Duration::from_secs(5)).await);
/// # }
/// ```
pub struct TestCluster {
    ctx: TestContext,
    network: Arc<LocalNetwork>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `node_ids` with the same copy settings
    pub fn new(node_ids: &[&str], settings: SegmentCopySettings) -> Self {
        let ctx = TestContext::new();
        let network = LocalNetwork::new();

        let members: Vec<_> = node_ids
            .iter()
            .enumerate()
            .map(|(i, id)| test_node(id, 9300 + i as u16))
            .collect();

        let nodes = members
            .iter()
            .map(|local| {
                let view = Arc::new(StaticClusterView::new(local.clone()));
                for member in &members {
                    view.add_node(member.clone());
                }

                let indices = IndicesService::new();
                let source = SegmentsCopySourceService::new(
                    settings.clone(),
                    Arc::new(network.transport(local.id.clone())),
                    view.clone(),
                );
                let target = SegmentsCopyTargetService::new(indices.clone(), settings.clone());
                indices.add_listener(&source);
                indices.add_listener(&target);
                network.register(local.id.clone(), target.clone());

                TestNode {
                    id: local.id.clone(),
                    indices,
                    source,
                    target,
                    view,
                }
            })
            .collect();

        Self {
            ctx,
            network,
            nodes,
        }
    }

    /// Shared network
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Look up a node
    pub fn node(&self, node_id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == node_id)
            .unwrap_or_else(|| panic!("unknown test node {}", node_id))
    }

    /// Allocate `shard_id` with its primary on `primary` and replicas elsewhere
    pub fn add_shard(&self, shard_id: &ShardId, primary: &str, replicas: &[&str]) {
        for node_id in std::iter::once(primary).chain(replicas.iter().copied()) {
            let dir = self
                .ctx
                .shard_dir(node_id)
                .join(format!("{}_{}", shard_id.index, shard_id.shard));
            let store = ShardStore::open(dir).expect("open test shard store");
            let shard = segment_shard(shard_id.clone(), store, node_id == primary);
            self.node(node_id)
                .indices
                .add_shard(shard)
                .expect("add test shard");
        }

        self.set_replication_group(ReplicationGroup {
            primary: ShardRouting::started(shard_id.clone(), primary, true),
            replicas: replicas
                .iter()
                .map(|r| ShardRouting::started(shard_id.clone(), *r, false))
                .collect(),
        });
    }

    /// Apply a routing change on every node
    pub fn set_replication_group(&self, group: ReplicationGroup) {
        for node in &self.nodes {
            node.view.set_replication_group(group.clone());
        }
    }

    /// Drop a replica from the routing of every node
    pub fn remove_replica(&self, shard_id: &ShardId, node_id: &str) {
        for node in &self.nodes {
            node.view.remove_replica(shard_id, node_id);
        }
    }

    /// Local copy of a shard on a node
    pub fn shard(&self, node_id: &str, shard_id: &ShardId) -> Arc<IndexShard> {
        self.node(node_id)
            .indices
            .shard(shard_id)
            .unwrap_or_else(|| panic!("{} not allocated on {}", shard_id, node_id))
    }

    /// Store of a shard copy
    pub fn store(&self, node_id: &str, shard_id: &ShardId) -> Arc<ShardStore> {
        self.shard(node_id, shard_id)
            .engine()
            .map(|e| e.store().clone())
            .unwrap_or_else(|| panic!("{} on {} has no engine", shard_id, node_id))
    }

    fn primary_of(&self, shard_id: &ShardId) -> Arc<IndexShard> {
        self.nodes
            .iter()
            .filter_map(|n| n.indices.shard(shard_id))
            .find(|s| s.is_primary())
            .unwrap_or_else(|| panic!("{} has no primary", shard_id))
    }

    /// Write new files on the primary and commit them
    ///
    /// Returns the committed version.
    pub fn commit(&self, shard_id: &ShardId, files: &[(&str, &[u8])]) -> u64 {
        let primary = self.primary_of(shard_id);
        let store = primary
            .engine()
            .map(|e| e.store().clone())
            .expect("primary engine");
        for (name, data) in files {
            store.write_file(name, data).expect("write test file");
        }
        primary.refresh(Vec::new()).expect("refresh primary");
        store.version()
    }

    /// Run one drive iteration on every node
    pub fn drive(&self) {
        for node in &self.nodes {
            node.source.drive_once();
        }
    }

    /// Drive until the copy of `shard_id` on `node_id` reaches `version`
    pub async fn wait_for_version(
        &self,
        node_id: &str,
        shard_id: &ShardId,
        version: u64,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.store(node_id, shard_id).version() >= version {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.drive();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
