//! Segment copy configuration

use crate::retry::RetryConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default chunk size (512 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Default replication throttle (40 MiB/s)
pub const DEFAULT_MAX_BYTES_PER_SEC: u64 = 40 * 1024 * 1024;

/// How an index keeps its replicas in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Replicas receive segment files copied from the primary
    Segment,
    /// Replicas replay the operation log
    #[default]
    Legacy,
}

/// Per-index settings consumed by the copy core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Replication mode of the index
    pub replication_mode: ReplicationMode,
}

impl IndexSettings {
    /// Settings for an index replicated by segment copy
    pub fn segment() -> Self {
        Self {
            replication_mode: ReplicationMode::Segment,
        }
    }

    /// Whether the index uses segment replication
    pub fn is_segment_replication(&self) -> bool {
        self.replication_mode == ReplicationMode::Segment
    }
}

/// Node-level segment copy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentCopySettings {
    /// Size of each file chunk sent to a replica
    pub chunk_size: usize,

    /// Maximum file chunks in flight per shard transfer
    pub max_concurrent_file_chunks: usize,

    /// Timeout for a single request (internal action timeout)
    #[serde(with = "serde_millis")]
    pub internal_action_timeout: Duration,

    /// Timeout for a whole copy round to one replica
    #[serde(with = "serde_millis")]
    pub copy_timeout: Duration,

    /// Outbound throttle in bytes per second (0 = unlimited)
    pub max_bytes_per_sec: u64,

    /// Interval between drive loop iterations
    #[serde(with = "serde_millis")]
    pub drive_interval: Duration,

    /// Retry policy for transient transport failures
    pub retry: RetryConfig,

    /// Number of recent responses a receiver keeps for duplicate detection
    pub response_cache_size: usize,

    /// Inbound requests handled concurrently by the TCP server
    pub max_in_flight_requests: usize,
}

impl Default for SegmentCopySettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_file_chunks: 2,
            internal_action_timeout: Duration::from_secs(15 * 60),
            copy_timeout: Duration::from_secs(30 * 60),
            max_bytes_per_sec: DEFAULT_MAX_BYTES_PER_SEC,
            drive_interval: Duration::from_secs(1),
            retry: RetryConfig::default(),
            response_cache_size: 1024,
            max_in_flight_requests: 64,
        }
    }
}

impl SegmentCopySettings {
    /// Set chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set maximum concurrent file chunks
    pub fn with_max_concurrent_file_chunks(mut self, max: usize) -> Self {
        self.max_concurrent_file_chunks = max;
        self
    }

    /// Set throttle rate (0 disables throttling)
    pub fn with_max_bytes_per_sec(mut self, rate: u64) -> Self {
        self.max_bytes_per_sec = rate;
        self
    }

    /// Set per-request and whole-round timeouts
    pub fn with_timeouts(mut self, internal_action: Duration, copy: Duration) -> Self {
        self.internal_action_timeout = internal_action;
        self.copy_timeout = copy;
        self
    }

    /// Set the drive loop interval
    pub fn with_drive_interval(mut self, interval: Duration) -> Self {
        self.drive_interval = interval;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be at least 1"));
        }

        if self.chunk_size > crate::protocol::MAX_FRAME_BYTES / 2 {
            return Err(Error::config(format!(
                "chunk_size {} exceeds half the maximum frame size {}",
                self.chunk_size,
                crate::protocol::MAX_FRAME_BYTES
            )));
        }

        if self.max_concurrent_file_chunks == 0 {
            return Err(Error::config(
                "max_concurrent_file_chunks must be at least 1",
            ));
        }

        if self.internal_action_timeout.is_zero() || self.copy_timeout.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }

        if self.copy_timeout < self.internal_action_timeout {
            return Err(Error::config(
                "copy_timeout must not be shorter than internal_action_timeout",
            ));
        }

        if self.max_in_flight_requests == 0 {
            return Err(Error::config("max_in_flight_requests must be at least 1"));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }

        Ok(())
    }
}
