//! Shard storage: commit snapshots and the on-disk shard store

pub mod shard_store;
pub mod snapshot;

pub use shard_store::{COMMIT_PREFIX, ShardStore, TEMP_PREFIX, validate_file_name};
pub use snapshot::{
    SegmentsCopyInfo, SnapshotDeleter, SnapshotListener, SnapshotRef, StoreFileMetadata,
};
