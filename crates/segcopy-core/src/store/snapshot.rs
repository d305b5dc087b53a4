//! Versioned, reference-counted commit snapshots
//!
//! A [`SnapshotRef`] pins the files of one commit against the store's
//! deletion policy. The pin is released exactly once: either explicitly via
//! [`SnapshotRef::release`] or when the guard is dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Metadata of one file of a commit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    /// File name, relative to the shard directory
    pub name: String,
    /// File length in bytes
    pub length: u64,
    /// CRC32 of the file contents
    pub checksum: u32,
}

impl StoreFileMetadata {
    /// Create file metadata
    pub fn new(name: impl Into<String>, length: u64, checksum: u32) -> Self {
        Self {
            name: name.into(),
            length,
            checksum,
        }
    }
}

/// Immutable description of one commit of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentsCopyInfo {
    /// Monotonic per-shard version
    pub version: u64,
    /// Commit generation
    pub generation: u64,
    /// Primary term the commit was produced under
    pub primary_term: u64,
    /// Serialized commit metadata
    pub infos_bytes: Vec<u8>,
    /// Every file belonging to the commit
    pub files: Vec<StoreFileMetadata>,
}

impl SegmentsCopyInfo {
    /// Names of all files of the commit
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.name.as_str())
    }

    /// Look up one file
    pub fn file(&self, name: &str) -> Option<&StoreFileMetadata> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Sum of all file lengths
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Authoritative name -> metadata map
    pub fn metadata_map(&self) -> BTreeMap<String, StoreFileMetadata> {
        self.files
            .iter()
            .map(|f| (f.name.clone(), f.clone()))
            .collect()
    }
}

/// Releases a snapshot's hold on its files
pub trait SnapshotDeleter: Send + Sync {
    /// Drop one reference on every file of `info`
    fn dec_ref(&self, info: &SegmentsCopyInfo);
}

/// Receives snapshots as the engine commits them
pub trait SnapshotListener: Send + Sync {
    /// Take ownership of a freshly acquired snapshot
    fn on_new_snapshot(&self, snapshot: SnapshotRef);
}

/// Owned reference on a commit snapshot
pub struct SnapshotRef {
    info: Arc<SegmentsCopyInfo>,
    deleter: Option<Arc<dyn SnapshotDeleter>>,
}

impl SnapshotRef {
    /// Wrap an already incremented reference
    pub fn new(info: Arc<SegmentsCopyInfo>, deleter: Arc<dyn SnapshotDeleter>) -> Self {
        Self {
            info,
            deleter: Some(deleter),
        }
    }

    /// A snapshot that pins nothing
    pub fn unmanaged(info: SegmentsCopyInfo) -> Self {
        Self {
            info: Arc::new(info),
            deleter: None,
        }
    }

    /// Commit description
    pub fn info(&self) -> &SegmentsCopyInfo {
        &self.info
    }

    /// Shared handle to the commit description
    pub fn info_arc(&self) -> Arc<SegmentsCopyInfo> {
        self.info.clone()
    }

    /// Snapshot version
    pub fn version(&self) -> u64 {
        self.info.version
    }

    /// Whether the reference has not been released yet
    pub fn is_live(&self) -> bool {
        self.deleter.is_some()
    }

    /// Release the reference now
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            deleter.dec_ref(&self.info);
        }
    }
}

impl Drop for SnapshotRef {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for SnapshotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotRef")
            .field("version", &self.info.version)
            .field("generation", &self.info.generation)
            .field("files", &self.info.files.len())
            .field("live", &self.deleter.is_some())
            .finish()
    }
}
