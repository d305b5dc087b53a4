//! Per-primary-shard copy driver
//!
//! Snapshots arrive from the store's commit listener and are queued. Each
//! drive iteration coalesces the queue down to the newest snapshot, which
//! becomes the current one; every other queued snapshot is released on the
//! spot. The current snapshot is held as `Arc<SnapshotRef>` so the pin is
//! dropped only after the last transfer using it has finished.

use super::remote_target::{CopyOutcome, RemoteTargetShardCopyState};
use super::{CopyStats, SourceContext};
use crate::Result;
use crate::cluster::ShardRouting;
use crate::protocol::CopyErrorType;
use crate::shard::IndexShard;
use crate::store::{ShardStore, SnapshotListener, SnapshotRef};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

struct ReplicaEntry {
    target: Arc<RemoteTargetShardCopyState>,
    copying: bool,
    round: u64,
    cancel: CancellationToken,
    acked_version: u64,
}

/// Copy driver of one primary shard
pub struct SourceShardCopyState {
    shard: Arc<IndexShard>,
    store: Arc<ShardStore>,
    ctx: Arc<SourceContext>,
    pending: Mutex<VecDeque<SnapshotRef>>,
    current: Mutex<Option<Arc<SnapshotRef>>>,
    replicas: Mutex<HashMap<String, ReplicaEntry>>,
    stats: Mutex<CopyStats>,
    next_round: AtomicU64,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SourceShardCopyState {
    /// Create the driver for `shard`, reading files from `store`
    pub fn new(shard: Arc<IndexShard>, store: Arc<ShardStore>, ctx: Arc<SourceContext>) -> Arc<Self> {
        Arc::new(Self {
            shard,
            store,
            ctx,
            pending: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            replicas: Mutex::new(HashMap::new()),
            stats: Mutex::new(CopyStats::default()),
            next_round: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Shard being replicated
    pub fn shard(&self) -> &Arc<IndexShard> {
        &self.shard
    }

    /// Queue a snapshot
    pub fn add(&self, snapshot: SnapshotRef) {
        if self.closed.load(Ordering::SeqCst) {
            snapshot.release();
            return;
        }
        self.pending.lock().push_back(snapshot);
    }

    /// Coalesce the queue and return the snapshot to replicate
    ///
    /// Every queued snapshot except the newest is released. The newest
    /// replaces the current one unless it is not newer. With an empty queue
    /// the existing current snapshot is returned.
    pub fn get(&self) -> Option<Arc<SnapshotRef>> {
        let drained: Vec<SnapshotRef> = self.pending.lock().drain(..).collect();

        let mut newest: Option<SnapshotRef> = None;
        for snapshot in drained {
            if let Some(superseded) = newest.replace(snapshot) {
                superseded.release();
            }
        }

        let mut current = self.current.lock();
        if let Some(newest) = newest {
            let is_newer = current
                .as_ref()
                .is_none_or(|existing| existing.version() < newest.version());
            if is_newer {
                *current = Some(Arc::new(newest));
            } else {
                newest.release();
            }
        }
        current.clone()
    }

    /// Start copying `snapshot` to `replica` unless a transfer is running
    ///
    /// Returns whether a transfer was started. Replicas whose node is not in
    /// the cluster view, or that already hold this version, are skipped.
    pub fn copy_to_one_replica(
        self: &Arc<Self>,
        replica: &ShardRouting,
        snapshot: &Arc<SnapshotRef>,
    ) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let Some(node_id) = replica.node_id.as_deref() else {
            return false;
        };
        let Some(node) = self.ctx.cluster.node(node_id) else {
            tracing::debug!(
                "Skipping replica of {} on {}: node not in cluster view",
                self.shard.shard_id(),
                node_id
            );
            return false;
        };

        let version = snapshot.version();
        let round = self.next_round.fetch_add(1, Ordering::SeqCst);
        let (target, cancel) = {
            let mut replicas = self.replicas.lock();
            let entry = replicas
                .entry(node_id.to_string())
                .or_insert_with(|| ReplicaEntry {
                    target: RemoteTargetShardCopyState::new(
                        self.shard.clone(),
                        self.store.clone(),
                        node.clone(),
                        self.ctx.clone(),
                    ),
                    copying: false,
                    round: 0,
                    cancel: CancellationToken::new(),
                    acked_version: 0,
                });
            if entry.copying || entry.acked_version >= version {
                return false;
            }
            if entry.target.node() != &node {
                entry.target = RemoteTargetShardCopyState::new(
                    self.shard.clone(),
                    self.store.clone(),
                    node.clone(),
                    self.ctx.clone(),
                );
            }
            entry.copying = true;
            entry.round = round;
            entry.cancel = self.cancel.child_token();
            (entry.target.clone(), entry.cancel.clone())
        };

        self.stats.lock().rounds_started += 1;
        tracing::debug!(
            "Copying {} version {} to {}",
            self.shard.shard_id(),
            version,
            node_id
        );

        let this = self.clone();
        let snapshot = snapshot.clone();
        let node_id = node_id.to_string();
        tokio::spawn(async move {
            let result = target.copy(snapshot, cancel).await;
            this.finish_copy(&node_id, round, version, result);
        });
        true
    }

    fn finish_copy(&self, node_id: &str, round: u64, version: u64, result: Result<CopyOutcome>) {
        {
            let mut replicas = self.replicas.lock();
            if let Some(entry) = replicas.get_mut(node_id).filter(|e| e.round == round) {
                entry.copying = false;
                let replica_has_version = match &result {
                    Ok(CopyOutcome::Completed(_)) => true,
                    Ok(CopyOutcome::Rejected(rejection)) => matches!(
                        rejection.error_type,
                        CopyErrorType::SegmentsInfoVersion | CopyErrorType::NoFilesNeedCopy
                    ),
                    Err(_) => false,
                };
                if replica_has_version {
                    entry.acked_version = entry.acked_version.max(version);
                }
            }
        }

        let shard_id = self.shard.shard_id();
        let mut stats = self.stats.lock();
        match result {
            Ok(CopyOutcome::Completed(summary)) => {
                stats.rounds_completed += 1;
                stats.files_sent += summary.files_sent;
                stats.bytes_sent += summary.bytes_sent;
                stats.throttle_time += summary.throttle_time;
                tracing::info!(
                    "Copied {} version {} to {}: {} files ({} bytes) sent, {} reused",
                    shard_id,
                    version,
                    node_id,
                    summary.files_sent,
                    summary.bytes_sent,
                    summary.files_reused
                );
            }
            Ok(CopyOutcome::Rejected(rejection)) => {
                stats.rounds_rejected += 1;
                if rejection.error_type.is_expected() {
                    tracing::debug!(
                        "Replica {} of {} declined version {}: {} ({})",
                        node_id,
                        shard_id,
                        version,
                        rejection.error_type,
                        rejection.message
                    );
                } else {
                    tracing::warn!(
                        "Replica {} of {} rejected version {}: {} ({})",
                        node_id,
                        shard_id,
                        version,
                        rejection.error_type,
                        rejection.message
                    );
                }
            }
            Err(e) if e.is_cancelled() => {
                stats.rounds_cancelled += 1;
                tracing::debug!("Copy of {} to {} cancelled", shard_id, node_id);
            }
            Err(e) => {
                stats.rounds_failed += 1;
                tracing::warn!(
                    "Copy of {} version {} to {} failed: {}",
                    shard_id,
                    version,
                    node_id,
                    e
                );
            }
        }
    }

    /// Cancel and forget the transfer state of one replica
    pub fn cancel_replica(&self, node_id: &str) -> bool {
        match self.replicas.lock().remove(node_id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!(
                    "Cancelled copy state of {} on {}",
                    self.shard.shard_id(),
                    node_id
                );
                true
            }
            None => false,
        }
    }

    /// Cancel every replica not in `node_ids`
    pub fn retain_replicas(&self, node_ids: &HashSet<String>) {
        let gone: Vec<String> = self
            .replicas
            .lock()
            .keys()
            .filter(|id| !node_ids.contains(*id))
            .cloned()
            .collect();
        for node_id in gone {
            self.cancel_replica(&node_id);
        }
    }

    /// Cancel all transfers and release every held snapshot
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.replicas.lock().clear();
        let pending: Vec<SnapshotRef> = self.pending.lock().drain(..).collect();
        for snapshot in pending {
            snapshot.release();
        }
        self.current.lock().take();
        tracing::debug!("Closed copy state of {}", self.shard.shard_id());
    }

    /// Whether [`SourceShardCopyState::close`] was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of queued snapshots
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Version of the current snapshot
    pub fn current_version(&self) -> Option<u64> {
        self.current.lock().as_ref().map(|s| s.version())
    }

    /// Whether a transfer to `node_id` is running
    pub fn is_copying(&self, node_id: &str) -> bool {
        self.replicas
            .lock()
            .get(node_id)
            .map(|e| e.copying)
            .unwrap_or(false)
    }

    /// Highest version `node_id` is known to hold
    pub fn acked_version(&self, node_id: &str) -> u64 {
        self.replicas
            .lock()
            .get(node_id)
            .map(|e| e.acked_version)
            .unwrap_or(0)
    }

    /// Copy statistics
    pub fn stats(&self) -> CopyStats {
        self.stats.lock().clone()
    }
}

impl SnapshotListener for SourceShardCopyState {
    fn on_new_snapshot(&self, snapshot: SnapshotRef) {
        self.add(snapshot);
    }
}
