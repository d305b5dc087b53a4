//! Primary-side segment copy
//!
//! The [`SegmentsCopySourceService`] owns one [`SourceShardCopyState`] per
//! started primary shard. Each drive iteration takes the most recent
//! snapshot of every shard and hands it to a [`RemoteTargetShardCopyState`]
//! per replica, which runs the four-step exchange:
//!
//! ```text
//! SegmentsInfo  ->  needed file names (or a structured rejection)
//! FilesInfo     ->  ack
//! FileChunk*    ->  ack        (smallest file first, bounded concurrency)
//! CleanFiles    ->  ack        (replica publishes the commit)
//! ```

mod remote_target;
mod service;
mod shard_state;

pub use remote_target::{CopyOutcome, RemoteTargetShardCopyState, TransferSummary};
pub use service::SegmentsCopySourceService;
pub use shard_state::SourceShardCopyState;

use crate::cluster::ClusterView;
use crate::config::SegmentCopySettings;
use crate::throttle::RateLimiter;
use crate::transport::CopyTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Node-wide collaborators shared by every outbound transfer
pub struct SourceContext {
    /// Copy settings
    pub settings: SegmentCopySettings,
    /// Outbound transport
    pub transport: Arc<dyn CopyTransport>,
    /// Membership and routing
    pub cluster: Arc<dyn ClusterView>,
    /// Outbound bandwidth throttle
    pub rate_limiter: RateLimiter,
    seq_no: AtomicU64,
}

impl SourceContext {
    /// Create a context
    pub fn new(
        settings: SegmentCopySettings,
        transport: Arc<dyn CopyTransport>,
        cluster: Arc<dyn ClusterView>,
    ) -> Arc<Self> {
        let rate_limiter = RateLimiter::new(settings.max_bytes_per_sec);
        Arc::new(Self {
            settings,
            transport,
            cluster,
            rate_limiter,
            seq_no: AtomicU64::new(initial_seq_no()),
        })
    }

    /// Next request sequence number of this node
    ///
    /// Numbering starts at the current time in microseconds so a restarted
    /// node does not reuse numbers a replica may still have cached.
    pub fn next_seq_no(&self) -> u64 {
        self.seq_no.fetch_add(1, Ordering::SeqCst)
    }

    /// ID of this node
    pub fn local_node_id(&self) -> String {
        self.cluster.local_node().id
    }
}

fn initial_seq_no() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(1)
        .max(1)
}

/// Per-shard outbound copy statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStats {
    /// Copy rounds started
    pub rounds_started: u64,
    /// Rounds that ended with the replica publishing the commit
    pub rounds_completed: u64,
    /// Rounds answered with a structured rejection
    pub rounds_rejected: u64,
    /// Rounds that failed (transport, store or timeout)
    pub rounds_failed: u64,
    /// Rounds cancelled before completion
    pub rounds_cancelled: u64,
    /// Files sent
    pub files_sent: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Time spent waiting on the throttle
    pub throttle_time: Duration,
}
