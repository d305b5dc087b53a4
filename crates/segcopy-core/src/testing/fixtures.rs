//! Small builders shared by unit and integration tests

use crate::cluster::DiscoveryNode;
use crate::config::IndexSettings;
use crate::shard::{EngineKind, IndexShard, ShardEngine, ShardId, ShardState};
use crate::store::{SegmentsCopyInfo, ShardStore, SnapshotDeleter, SnapshotRef, StoreFileMetadata};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

/// Node on the loopback interface
pub fn test_node(id: &str, port: u16) -> DiscoveryNode {
    DiscoveryNode::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
}

/// Started shard of a segment-replicated index with its engine attached
pub fn segment_shard(shard_id: ShardId, store: Arc<ShardStore>, primary: bool) -> Arc<IndexShard> {
    let shard = IndexShard::new(shard_id, IndexSettings::segment(), primary);
    shard.attach_engine(ShardEngine::new(EngineKind::Segment, store));
    shard.set_state(ShardState::Started);
    shard
}

/// Write `files` into `store` and commit them
pub fn commit_files(
    store: &ShardStore,
    primary_term: u64,
    files: &[(&str, &[u8])],
) -> Option<Arc<SegmentsCopyInfo>> {
    for (name, data) in files {
        store.write_file(name, data).expect("write test file");
    }
    store.commit(primary_term, Vec::new()).expect("commit test files")
}

/// Deleter that records which snapshot versions were released
#[derive(Default)]
pub struct CountingDeleter {
    released: Mutex<Vec<u64>>,
}

impl CountingDeleter {
    /// Create a deleter
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A managed snapshot of `version` with two files
    pub fn snapshot(self: &Arc<Self>, version: u64) -> SnapshotRef {
        let info = SegmentsCopyInfo {
            version,
            generation: version,
            primary_term: 1,
            infos_bytes: Vec::new(),
            files: vec![
                StoreFileMetadata::new(format!("_{}.cfs", version), 10, 0),
                StoreFileMetadata::new("_base.cfs", 100, 0),
            ],
        };
        SnapshotRef::new(Arc::new(info), self.clone())
    }

    /// Released versions, in release order
    pub fn released(&self) -> Vec<u64> {
        self.released.lock().clone()
    }
}

impl SnapshotDeleter for CountingDeleter {
    fn dec_ref(&self, info: &SegmentsCopyInfo) {
        self.released.lock().push(info.version);
    }
}
