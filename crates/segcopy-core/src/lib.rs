//! Segcopy Core - segment-based primary to replica file copy
//!
//! A primary shard publishes immutable commits ("snapshots"). This crate
//! keeps every replica of the shard converging on the newest one by copying
//! only the segment files the replica does not have yet:
//! - Snapshot pinning against the store's deletion policy
//! - Most-recent-wins coalescing of commits on the primary
//! - A four-step copy exchange with retry, throttling and cancellation
//! - Stage-then-publish application of incoming files on the replica
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐          ┌──────────────────────────────┐
//! │ SegmentsCopySourceService    │          │ SegmentsCopyTargetService    │
//! │   (drive loop, per node)     │          │   (request dispatch)         │
//! └──────────────┬───────────────┘          └──────────────▲───────────────┘
//!                │                                         │
//! ┌──────────────┴───────────────┐          ┌──────────────┴───────────────┐
//! │ SourceShardCopyState         │          │ LocalTargetShardCopyState    │
//! │   (coalescing, per shard)    │          │   (state machine, per shard) │
//! └──────────────┬───────────────┘          └──────────────▲───────────────┘
//!                │                                         │
//! ┌──────────────┴───────────────┐  frames  ┌──────────────┴───────────────┐
//! │ RemoteTargetShardCopyState   ├─────────►│ CopyTransport / TcpCopyServer│
//! │   (per replica)              │          │                              │
//! └──────────────────────────────┘          └──────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod shard;
pub mod source;
pub mod store;
pub mod target;
pub mod throttle;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{IndexSettings, ReplicationMode, SegmentCopySettings};
pub use error::{Error, Result, TransportErrorKind};
pub use protocol::{CopyErrorType, CopyTransportRequest};
pub use shard::{IndexShard, IndicesService, ShardId};
pub use source::{SegmentsCopySourceService, SourceShardCopyState};
pub use store::{SegmentsCopyInfo, ShardStore, SnapshotRef};
pub use target::{LocalTargetShardCopyState, SegmentsCopyTargetService};
