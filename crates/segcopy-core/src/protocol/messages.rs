//! Segment copy request and response types

use crate::shard::ShardId;
use crate::store::{SegmentsCopyInfo, StoreFileMetadata};
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rejection reasons carried by [`ErrorResponse`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyErrorType {
    /// A transfer for the shard is already in progress
    IsRunning,
    /// The announcing primary's term is stale
    PrimaryTerm,
    /// The announced version is not newer than the local one
    SegmentsInfoVersion,
    /// The replica already has every announced file
    NoFilesNeedCopy,
    /// The shard is missing, closed or the request is out of order
    Shard,
    /// The shard's engine cannot take part in segment copy
    Engine,
}

impl CopyErrorType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IsRunning => "IS_RUNNING_ERROR",
            Self::PrimaryTerm => "PRIMARY_TERM_ERROR",
            Self::SegmentsInfoVersion => "SEGMENTS_INFO_VERSION_ERROR",
            Self::NoFilesNeedCopy => "NO_FILES_NEED_COPY_ERROR",
            Self::Shard => "SHARD_ERROR",
            Self::Engine => "ENGINE_ERROR",
        }
    }

    /// Steady-state outcomes that need no escalation
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::IsRunning | Self::SegmentsInfoVersion | Self::NoFilesNeedCopy
        )
    }
}

impl std::fmt::Display for CopyErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every segment copy request
pub trait CopyTransportRequest {
    /// Sequence number used to recognise retried deliveries
    fn request_seq_no(&self) -> u64;

    /// Target shard
    fn shard_id(&self) -> &ShardId;
}

/// Announce a new commit to a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentsInfoRequest {
    /// Request sequence number
    pub request_seq_no: u64,
    /// Target shard
    pub shard_id: ShardId,
    /// Announcing node
    pub source_node: String,
    /// Commit version
    pub version: u64,
    /// Commit generation
    pub generation: u64,
    /// Primary term of the announcing primary
    pub primary_term: u64,
    /// Serialized commit metadata
    pub infos_bytes: Vec<u8>,
    /// Names of all files of the commit
    pub file_names: Vec<String>,
    /// Sizes aligned with `file_names`
    pub file_sizes: Vec<u64>,
    /// Checksums aligned with `file_names`
    pub file_checksums: Vec<u32>,
}

impl SegmentsInfoRequest {
    /// Build an announcement for `info`
    pub fn from_snapshot(
        request_seq_no: u64,
        shard_id: ShardId,
        source_node: impl Into<String>,
        primary_term: u64,
        info: &SegmentsCopyInfo,
    ) -> Self {
        Self {
            request_seq_no,
            shard_id,
            source_node: source_node.into(),
            version: info.version,
            generation: info.generation,
            primary_term,
            infos_bytes: info.infos_bytes.clone(),
            file_names: info.files.iter().map(|f| f.name.clone()).collect(),
            file_sizes: info.files.iter().map(|f| f.length).collect(),
            file_checksums: info.files.iter().map(|f| f.checksum).collect(),
        }
    }

    /// Rebuild the announced commit
    pub fn to_copy_info(&self) -> Result<SegmentsCopyInfo> {
        if self.file_names.len() != self.file_sizes.len()
            || self.file_names.len() != self.file_checksums.len()
        {
            return Err(Error::protocol(format!(
                "Misaligned file lists: {} names, {} sizes, {} checksums",
                self.file_names.len(),
                self.file_sizes.len(),
                self.file_checksums.len()
            )));
        }
        let files = self
            .file_names
            .iter()
            .zip(&self.file_sizes)
            .zip(&self.file_checksums)
            .map(|((name, &length), &checksum)| StoreFileMetadata::new(name.clone(), length, checksum))
            .collect();
        Ok(SegmentsCopyInfo {
            version: self.version,
            generation: self.generation,
            primary_term: self.primary_term,
            infos_bytes: self.infos_bytes.clone(),
            files,
        })
    }
}

/// Files the replica still needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentsInfoResponse {
    /// Names of the missing files
    pub file_names: Vec<String>,
}

/// Declare the files about to be sent and those already present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFilesInfoRequest {
    /// Request sequence number
    pub request_seq_no: u64,
    /// Target shard
    pub shard_id: ShardId,
    /// Files to be sent
    pub file_names: Vec<String>,
    /// Sizes aligned with `file_names`
    pub file_sizes: Vec<u64>,
    /// Files the replica already has
    pub existing_file_names: Vec<String>,
    /// Sizes aligned with `existing_file_names`
    pub existing_file_sizes: Vec<u64>,
}

/// One chunk of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFileChunkRequest {
    /// Request sequence number
    pub request_seq_no: u64,
    /// Target shard
    pub shard_id: ShardId,
    /// File the chunk belongs to
    pub file_metadata: StoreFileMetadata,
    /// Byte offset of the chunk
    pub position: u64,
    /// Chunk payload
    pub content: Bytes,
    /// Final chunk of the file
    pub last_chunk: bool,
    /// Translog operations covered by the transfer
    pub total_translog_ops: i32,
    /// Time the source spent throttled so far
    pub source_throttle_nanos: u64,
}

/// Finalize: publish the staged files and prune the rest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyCleanFilesRequest {
    /// Request sequence number
    pub request_seq_no: u64,
    /// Target shard
    pub shard_id: ShardId,
    /// Authoritative file set of the commit
    pub file_metadata_map: BTreeMap<String, StoreFileMetadata>,
    /// Primary's global checkpoint
    pub global_checkpoint: i64,
}

/// Structured rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Rejection reason
    pub error_type: CopyErrorType,
    /// Human readable detail
    pub message: String,
}

impl ErrorResponse {
    /// Create an error response
    pub fn new(error_type: CopyErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

macro_rules! impl_copy_transport_request {
    ($($ty:ty),*) => {
        $(
            impl CopyTransportRequest for $ty {
                fn request_seq_no(&self) -> u64 {
                    self.request_seq_no
                }

                fn shard_id(&self) -> &ShardId {
                    &self.shard_id
                }
            }
        )*
    };
}

impl_copy_transport_request!(
    SegmentsInfoRequest,
    CopyFilesInfoRequest,
    CopyFileChunkRequest,
    CopyCleanFilesRequest
);

/// Any segment copy request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyRequest {
    /// Announce a commit
    SegmentsInfo(SegmentsInfoRequest),
    /// Declare files
    FilesInfo(CopyFilesInfoRequest),
    /// File chunk
    FileChunk(CopyFileChunkRequest),
    /// Finalize
    CleanFiles(CopyCleanFilesRequest),
}

impl CopyRequest {
    /// Transport action name
    pub fn action(&self) -> &'static str {
        match self {
            Self::SegmentsInfo(_) => "internal:index/shard/segments_copy/segments_info",
            Self::FilesInfo(_) => "internal:index/shard/segments_copy/files_info",
            Self::FileChunk(_) => "internal:index/shard/segments_copy/file_chunk",
            Self::CleanFiles(_) => "internal:index/shard/segments_copy/clean_files",
        }
    }

    fn inner(&self) -> &dyn CopyTransportRequest {
        match self {
            Self::SegmentsInfo(r) => r,
            Self::FilesInfo(r) => r,
            Self::FileChunk(r) => r,
            Self::CleanFiles(r) => r,
        }
    }
}

impl CopyTransportRequest for CopyRequest {
    fn request_seq_no(&self) -> u64 {
        self.inner().request_seq_no()
    }

    fn shard_id(&self) -> &ShardId {
        self.inner().shard_id()
    }
}

/// Any segment copy response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyResponse {
    /// Announcement accepted
    SegmentsInfo(SegmentsInfoResponse),
    /// Request applied
    Ack {
        /// Sequence number of the acknowledged request
        request_seq_no: u64,
    },
    /// Structured rejection
    Error(ErrorResponse),
}

impl CopyResponse {
    /// Shorthand for an error response
    pub fn error(error_type: CopyErrorType, message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse::new(error_type, message))
    }

    /// Rejection reason, if this is an error response
    pub fn error_type(&self) -> Option<CopyErrorType> {
        match self {
            Self::Error(e) => Some(e.error_type),
            _ => None,
        }
    }
}
