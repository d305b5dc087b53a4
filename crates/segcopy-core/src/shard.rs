//! Local shards and the node-wide shard registry
//!
//! An [`IndexShard`] exists before its engine does: the engine is attached
//! once the shard's store has been opened, which is why the copy services
//! poll for engine readiness instead of waiting on an event.

use crate::config::IndexSettings;
use crate::store::ShardStore;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Global checkpoint before any operation was acknowledged
pub const UNASSIGNED_CHECKPOINT: i64 = -1;

/// Identifier of one shard of an index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name
    pub index: String,
    /// Shard number within the index
    pub shard: u32,
}

impl ShardId {
    /// Create a shard id
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Lifecycle state of a local shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    /// Shard object exists, nothing opened yet
    Created,
    /// Store is being recovered
    Recovering,
    /// Recovery done, not yet reported started
    PostRecovery,
    /// Serving
    Started,
    /// Closed; must not take part in copying
    Closed,
}

/// Kind of engine backing a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    /// Engine whose commits can be copied segment by segment
    Segment,
    /// Operation-log replicated engine
    Legacy,
}

/// Engine handle of a shard
pub struct ShardEngine {
    kind: EngineKind,
    store: Arc<ShardStore>,
}

impl ShardEngine {
    /// Create an engine over `store`
    pub fn new(kind: EngineKind, store: Arc<ShardStore>) -> Arc<Self> {
        Arc::new(Self { kind, store })
    }

    /// Engine kind
    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Whether this engine takes part in segment copy
    pub fn is_segment_copy(&self) -> bool {
        self.kind == EngineKind::Segment
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }
}

/// A shard hosted on this node
pub struct IndexShard {
    shard_id: ShardId,
    settings: IndexSettings,
    state: RwLock<ShardState>,
    primary: AtomicBool,
    primary_term: AtomicU64,
    global_checkpoint: AtomicI64,
    engine: RwLock<Option<Arc<ShardEngine>>>,
}

impl IndexShard {
    /// Create a shard with no engine attached
    pub fn new(shard_id: ShardId, settings: IndexSettings, primary: bool) -> Arc<Self> {
        Arc::new(Self {
            shard_id,
            settings,
            state: RwLock::new(ShardState::Created),
            primary: AtomicBool::new(primary),
            primary_term: AtomicU64::new(1),
            global_checkpoint: AtomicI64::new(UNASSIGNED_CHECKPOINT),
            engine: RwLock::new(None),
        })
    }

    /// Shard id
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Index settings
    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// Current lifecycle state
    pub fn state(&self) -> ShardState {
        *self.state.read()
    }

    /// Move to a new lifecycle state
    pub fn set_state(&self, state: ShardState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!("Shard {} state {:?} -> {:?}", self.shard_id, *current, state);
            *current = state;
        }
    }

    /// Whether this copy is the routing-table primary
    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    /// Promote or demote this copy
    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }

    /// Highest primary term observed
    pub fn primary_term(&self) -> u64 {
        self.primary_term.load(Ordering::SeqCst)
    }

    /// Raise the primary term; lower values are ignored
    pub fn update_primary_term(&self, term: u64) {
        self.primary_term.fetch_max(term, Ordering::SeqCst);
    }

    /// Current global checkpoint
    pub fn global_checkpoint(&self) -> i64 {
        self.global_checkpoint.load(Ordering::SeqCst)
    }

    /// Advance the global checkpoint; it never moves backwards
    pub fn update_global_checkpoint(&self, checkpoint: i64) {
        self.global_checkpoint.fetch_max(checkpoint, Ordering::SeqCst);
    }

    /// Engine, once attached
    pub fn engine(&self) -> Option<Arc<ShardEngine>> {
        self.engine.read().clone()
    }

    /// Attach the engine after the store has been opened
    pub fn attach_engine(&self, engine: Arc<ShardEngine>) {
        *self.engine.write() = Some(engine);
    }

    /// Commit the live files of a primary shard
    pub fn refresh(&self, infos_bytes: Vec<u8>) -> Result<bool> {
        if !self.is_primary() {
            return Err(Error::shard(format!(
                "Shard {} is not a primary",
                self.shard_id
            )));
        }
        let engine = self
            .engine()
            .ok_or_else(|| Error::shard(format!("Shard {} has no engine", self.shard_id)))?;
        Ok(engine
            .store()
            .commit(self.primary_term(), infos_bytes)?
            .is_some())
    }

    /// Close the shard
    pub fn close(&self) {
        self.set_state(ShardState::Closed);
    }
}

/// Notified on shard lifecycle changes
pub trait IndexEventListener: Send + Sync {
    /// A shard was registered on this node
    fn after_shard_created(&self, shard: &Arc<IndexShard>);

    /// A shard is about to be removed from this node
    fn before_shard_closed(&self, shard_id: &ShardId);
}

/// Node-wide registry of local shards
#[derive(Default)]
pub struct IndicesService {
    shards: DashMap<ShardId, Arc<IndexShard>>,
    listeners: RwLock<Vec<Weak<dyn IndexEventListener>>>,
}

impl IndicesService {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to shard lifecycle events
    ///
    /// Only a weak reference is kept; a dropped listener is skipped.
    pub fn add_listener<L: IndexEventListener + 'static>(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener) as Weak<dyn IndexEventListener>;
        self.listeners.write().push(weak);
    }

    fn live_listeners(&self) -> Vec<Arc<dyn IndexEventListener>> {
        let mut listeners = self.listeners.write();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    /// Register a shard
    pub fn add_shard(&self, shard: Arc<IndexShard>) -> Result<()> {
        let id = shard.shard_id().clone();
        if self.shards.contains_key(&id) {
            return Err(Error::shard(format!("Shard {} already exists", id)));
        }
        self.shards.insert(id, shard.clone());
        for listener in self.live_listeners() {
            listener.after_shard_created(&shard);
        }
        Ok(())
    }

    /// Close and remove a shard
    pub fn remove_shard(&self, shard_id: &ShardId) -> Option<Arc<IndexShard>> {
        if !self.shards.contains_key(shard_id) {
            return None;
        }
        for listener in self.live_listeners() {
            listener.before_shard_closed(shard_id);
        }
        let (_, shard) = self.shards.remove(shard_id)?;
        shard.close();
        Some(shard)
    }

    /// Look up a shard
    pub fn shard(&self, shard_id: &ShardId) -> Option<Arc<IndexShard>> {
        self.shards.get(shard_id).map(|s| s.value().clone())
    }

    /// All local shards
    pub fn shards(&self) -> Vec<Arc<IndexShard>> {
        self.shards.iter().map(|s| s.value().clone()).collect()
    }
}
