//! Node-wide coordinator of outbound segment copy

use super::shard_state::SourceShardCopyState;
use super::{CopyStats, SourceContext};
use crate::cluster::{ClusterView, ShardRouting};
use crate::config::SegmentCopySettings;
use crate::registry::ShardRegistry;
use crate::shard::{IndexEventListener, IndexShard, ShardId, ShardState};
use crate::transport::CopyTransport;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

/// Drives segment copy for every started primary shard on this node
///
/// Shards enter through [`IndexEventListener::after_shard_created`] and wait
/// in a pending list until their engine is attached. Each drive iteration
/// promotes ready shards, drops shards that are no longer started
/// primaries, and starts a transfer to every replica that is not already
/// copying.
pub struct SegmentsCopySourceService {
    ctx: Arc<SourceContext>,
    shards: ShardRegistry<SourceShardCopyState>,
    pending: Mutex<Vec<Arc<IndexShard>>>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SegmentsCopySourceService {
    /// Create the service
    pub fn new(
        settings: SegmentCopySettings,
        transport: Arc<dyn CopyTransport>,
        cluster: Arc<dyn ClusterView>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx: SourceContext::new(settings, transport, cluster),
            shards: ShardRegistry::new(),
            pending: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
        })
    }

    /// Shared outbound context
    pub fn context(&self) -> &Arc<SourceContext> {
        &self.ctx
    }

    /// Stage a shard until its engine is ready
    pub fn stage_shard(&self, shard: Arc<IndexShard>) {
        let mut pending = self.pending.lock();
        if !pending.iter().any(|s| s.shard_id() == shard.shard_id()) {
            pending.push(shard);
        }
    }

    /// Number of staged shards
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Copy state of a promoted shard
    pub fn shard_state(&self, shard_id: &ShardId) -> Option<Arc<SourceShardCopyState>> {
        self.shards.get(shard_id)
    }

    /// Statistics of every promoted shard
    pub fn stats(&self) -> Vec<(ShardId, CopyStats)> {
        self.shards
            .values()
            .into_iter()
            .map(|s| (s.shard().shard_id().clone(), s.stats()))
            .collect()
    }

    /// Run one drive iteration
    ///
    /// Transfers are spawned on the current tokio runtime; this call does
    /// not wait for them.
    pub fn drive_once(&self) {
        self.promote_pending();

        let local_node_id = self.ctx.cluster.local_node().id;
        for state in self.shards.values() {
            if !self.check_shard_state(&state) {
                continue;
            }
            let shard_id = state.shard().shard_id();
            let snapshot = state.get();

            let Some(group) = self.ctx.cluster.replication_group(shard_id) else {
                state.retain_replicas(&HashSet::new());
                continue;
            };
            let targets: Vec<&ShardRouting> = group
                .replication_targets()
                .into_iter()
                .filter(|r| r.node_id.as_deref() != Some(local_node_id.as_str()))
                .collect();
            let target_ids: HashSet<String> =
                targets.iter().filter_map(|r| r.node_id.clone()).collect();
            state.retain_replicas(&target_ids);

            let Some(snapshot) = snapshot else {
                continue;
            };
            for replica in targets {
                state.copy_to_one_replica(replica, &snapshot);
            }
        }
    }

    /// Whether the shard is still a started primary
    ///
    /// A closed shard is forgotten. A shard that stopped being a started
    /// primary loses its copy state and is staged again, so a later
    /// promotion brings it back.
    pub fn check_shard_state(&self, state: &Arc<SourceShardCopyState>) -> bool {
        let shard = state.shard();
        match shard.state() {
            ShardState::Closed => {
                self.remove_shard(shard.shard_id(), false);
                false
            }
            ShardState::Started if shard.is_primary() => true,
            other => {
                tracing::info!(
                    "Shard {} is no longer a started primary ({:?}, primary={}), stopping segment copy",
                    shard.shard_id(),
                    other,
                    shard.is_primary()
                );
                self.remove_shard(shard.shard_id(), true);
                false
            }
        }
    }

    fn promote_pending(&self) {
        let staged: Vec<Arc<IndexShard>> = std::mem::take(&mut *self.pending.lock());
        let mut keep = Vec::new();

        for shard in staged {
            if shard.state() == ShardState::Closed {
                tracing::debug!("Dropping closed shard {} from pending", shard.shard_id());
                continue;
            }
            let Some(engine) = shard.engine() else {
                keep.push(shard);
                continue;
            };
            if !engine.is_segment_copy() {
                tracing::debug!(
                    "Shard {} uses a {:?} engine, not eligible for segment copy",
                    shard.shard_id(),
                    engine.kind()
                );
                continue;
            }
            if shard.state() != ShardState::Started || !shard.is_primary() {
                keep.push(shard);
                continue;
            }

            let store = engine.store().clone();
            let Ok(state) = self.shards.get_or_try_insert(shard.shard_id(), || {
                Ok::<_, Infallible>(SourceShardCopyState::new(
                    shard.clone(),
                    store.clone(),
                    self.ctx.clone(),
                ))
            });
            store.set_listener(state.clone());
            if let Some(latest) = store.acquire_latest() {
                state.add(latest);
            }
            tracing::info!("Segment copy enabled for primary {}", shard.shard_id());
        }

        if !keep.is_empty() {
            let mut pending = self.pending.lock();
            for shard in keep {
                if !pending.iter().any(|s| s.shard_id() == shard.shard_id()) {
                    pending.push(shard);
                }
            }
        }
    }

    fn remove_shard(&self, shard_id: &ShardId, restage: bool) {
        let Some(state) = self.shards.remove(shard_id) else {
            return;
        };
        if let Some(engine) = state.shard().engine() {
            engine.store().clear_listener();
        }
        state.close();
        if restage {
            self.stage_shard(state.shard().clone());
        }
    }

    /// Run the drive loop until [`SegmentsCopySourceService::stop`] is called
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::internal("Segment copy source service already running"));
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let mut ticker = tokio::time::interval(self.ctx.settings.drive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "Segment copy source service started (interval {:?})",
            self.ctx.settings.drive_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drive_once();
                }
                _ = &mut shutdown_rx => {
                    tracing::info!("Segment copy source service shutting down");
                    break;
                }
            }
        }

        for state in self.shards.values() {
            self.remove_shard(state.shard().shard_id(), false);
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the drive loop
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl IndexEventListener for SegmentsCopySourceService {
    fn after_shard_created(&self, shard: &Arc<IndexShard>) {
        if shard.settings().is_segment_replication() {
            self.stage_shard(shard.clone());
        }
    }

    fn before_shard_closed(&self, shard_id: &ShardId) {
        self.pending.lock().retain(|s| s.shard_id() != shard_id);
        self.remove_shard(shard_id, false);
    }
}
