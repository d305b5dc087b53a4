//! Replica-side receiver of one shard
//!
//! A transfer moves through
//!
//! ```text
//! Idle -> ReceivingSegmentsInfo -> ReceivingFiles -> Cleaning -> Idle
//! ```
//!
//! Incoming bytes land in staging files and only appear under their final
//! names once the clean-files step publishes the commit. A violation coming
//! from the source of the open transfer aborts it: staging files are
//! discarded and the primary has to announce again. Requests from any other
//! node, or outside an open transfer, are rejected without touching it.

use crate::config::SegmentCopySettings;
use crate::protocol::{
    CopyCleanFilesRequest, CopyErrorType, CopyFileChunkRequest, CopyFilesInfoRequest, CopyRequest,
    CopyResponse, SegmentsInfoRequest, SegmentsInfoResponse,
};
use crate::shard::IndexShard;
use crate::store::{SegmentsCopyInfo, ShardStore, StoreFileMetadata, validate_file_name};
use crate::{CopyTransportRequest, Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Phase of the receiver state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPhase {
    /// No transfer open
    Idle,
    /// Validating an announcement
    ReceivingSegmentsInfo,
    /// Announcement accepted, receiving file chunks
    ReceivingFiles,
    /// Publishing the commit
    Cleaning,
}

/// Inbound copy statistics of one shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Announcements accepted
    pub transfers_started: u64,
    /// Transfers that published their commit
    pub transfers_completed: u64,
    /// Transfers abandoned after a failure or expiry
    pub transfers_aborted: u64,
    /// Announcements answered with a rejection
    pub announcements_rejected: u64,
    /// Files received and verified
    pub files_received: u64,
    /// Chunk payload bytes written
    pub bytes_received: u64,
    /// Requests answered from the response cache
    pub duplicate_requests: u64,
}

struct IncomingFile {
    meta: StoreFileMetadata,
    temp: Option<String>,
    // position -> length of every chunk written
    chunks: BTreeMap<u64, u64>,
    received: u64,
    verified: bool,
}

impl IncomingFile {
    fn new(meta: StoreFileMetadata) -> Self {
        Self {
            meta,
            temp: None,
            chunks: BTreeMap::new(),
            received: 0,
            verified: false,
        }
    }

    /// Whether `[position, end)` overlaps a different chunk
    fn overlaps(&self, position: u64, end: u64) -> bool {
        let before = self
            .chunks
            .range(..position)
            .next_back()
            .is_some_and(|(&start, &l)| start + l > position);
        let after = self
            .chunks
            .range(position..)
            .next()
            .is_some_and(|(&start, _)| start == position || start < end);
        before || after
    }
}

struct Transfer {
    source_node: String,
    info: SegmentsCopyInfo,
    files: HashMap<String, IncomingFile>,
    declared: bool,
    last_activity: Instant,
}

impl Transfer {
    fn temps(&self) -> Vec<String> {
        self.files.values().filter_map(|f| f.temp.clone()).collect()
    }
}

type ResponseKey = (String, u64);

struct ResponseCache {
    capacity: usize,
    entries: HashMap<ResponseKey, CopyResponse>,
    order: VecDeque<ResponseKey>,
}

impl ResponseCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &ResponseKey) -> Option<CopyResponse> {
        let response = self.entries.get(key).cloned()?;
        if let Some(index) = self.order.iter().position(|k| k == key) {
            if let Some(hit) = self.order.remove(index) {
                self.order.push_back(hit);
            }
        }
        Some(response)
    }

    fn insert(&mut self, key: ResponseKey, response: CopyResponse) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key.clone(), response).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

struct ReceiverState {
    phase: CopyPhase,
    transfer: Option<Transfer>,
    last_version: u64,
    highest_term: u64,
    responses: ResponseCache,
}

/// Receiver of segment copies for one replica shard
pub struct LocalTargetShardCopyState {
    shard: Arc<IndexShard>,
    store: Arc<ShardStore>,
    inactivity_timeout: Duration,
    // Held across store I/O, so chunk writes of one shard are serialized
    state: tokio::sync::Mutex<ReceiverState>,
    running: AtomicBool,
    last_version: AtomicU64,
    closed: AtomicBool,
    stats: Mutex<ReceiverStats>,
}

impl LocalTargetShardCopyState {
    /// Create the receiver of `shard`, writing into `store`
    pub fn new(
        shard: Arc<IndexShard>,
        store: Arc<ShardStore>,
        settings: &SegmentCopySettings,
    ) -> Arc<Self> {
        let version = store.version();
        Arc::new(Self {
            shard,
            store,
            inactivity_timeout: settings.internal_action_timeout,
            state: tokio::sync::Mutex::new(ReceiverState {
                phase: CopyPhase::Idle,
                transfer: None,
                last_version: version,
                highest_term: 0,
                responses: ResponseCache::new(settings.response_cache_size),
            }),
            running: AtomicBool::new(false),
            last_version: AtomicU64::new(version),
            closed: AtomicBool::new(false),
            stats: Mutex::new(ReceiverStats::default()),
        })
    }

    /// Shard being received
    pub fn shard(&self) -> &Arc<IndexShard> {
        &self.shard
    }

    /// Whether a transfer is open
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Version of the last published commit
    pub fn last_version(&self) -> u64 {
        self.last_version.load(Ordering::SeqCst)
    }

    /// Current phase
    pub async fn phase(&self) -> CopyPhase {
        self.state.lock().await.phase
    }

    /// Inbound statistics
    pub fn stats(&self) -> ReceiverStats {
        self.stats.lock().clone()
    }

    /// Apply one request from `source_node`
    ///
    /// A request whose `(source_node, request_seq_no)` was already answered
    /// gets the recorded response again without being re-applied.
    pub async fn handle(&self, source_node: &str, request: CopyRequest) -> CopyResponse {
        let key = (source_node.to_string(), request.request_seq_no());
        let mut state = self.state.lock().await;

        if let Some(cached) = state.responses.get(&key) {
            self.stats.lock().duplicate_requests += 1;
            tracing::debug!(
                "Replaying response to {} #{} for {}",
                request.action(),
                key.1,
                self.shard.shard_id()
            );
            return cached;
        }
        if self.closed.load(Ordering::SeqCst) {
            return CopyResponse::error(
                CopyErrorType::Shard,
                format!("Shard {} is closed", self.shard.shard_id()),
            );
        }

        let response = match request {
            CopyRequest::SegmentsInfo(r) => self.on_segments_info(&mut state, source_node, r).await,
            CopyRequest::FilesInfo(r) => self.on_files_info(&mut state, source_node, r).await,
            CopyRequest::FileChunk(r) => self.on_file_chunk(&mut state, source_node, r).await,
            CopyRequest::CleanFiles(r) => self.on_clean_files(&mut state, source_node, r).await,
        };

        // Closed while the request was being applied
        if self.closed.load(Ordering::SeqCst) && state.transfer.is_some() {
            self.abort(&mut state, "shard closed").await;
        }

        state.responses.insert(key, response.clone());
        response
    }

    async fn on_segments_info(
        &self,
        state: &mut ReceiverState,
        source_node: &str,
        request: SegmentsInfoRequest,
    ) -> CopyResponse {
        let shard_id = self.shard.shard_id();

        if state.phase != CopyPhase::Idle {
            // A newer primary term fences the open transfer
            let superseded = state
                .transfer
                .as_ref()
                .is_some_and(|t| t.info.primary_term < request.primary_term);
            let expired = state
                .transfer
                .as_ref()
                .is_some_and(|t| t.last_activity.elapsed() >= self.inactivity_timeout);
            if superseded {
                let reason = format!(
                    "superseded by primary term {} from {}",
                    request.primary_term, source_node
                );
                self.abort(state, &reason).await;
            } else if expired {
                tracing::warn!(
                    "Abandoning inactive transfer of {} to accept a new announcement from {}",
                    shard_id,
                    source_node
                );
                self.abort(state, "transfer inactive").await;
            } else {
                return self.reject(
                    CopyErrorType::IsRunning,
                    format!(
                        "Shard {} is already receiving version {:?}",
                        shard_id,
                        state.transfer.as_ref().map(|t| t.info.version)
                    ),
                );
            }
        }

        self.set_phase(state, CopyPhase::ReceivingSegmentsInfo);
        match self.accept_announcement(state, source_node, &request) {
            Ok(transfer) => {
                let needed: Vec<String> = transfer
                    .info
                    .files
                    .iter()
                    .filter(|f| transfer.files.contains_key(&f.name))
                    .map(|f| f.name.clone())
                    .collect();
                tracing::info!(
                    "Receiving {} version {} from {}: {} of {} files needed",
                    shard_id,
                    transfer.info.version,
                    source_node,
                    needed.len(),
                    transfer.info.files.len()
                );
                state.transfer = Some(transfer);
                self.set_phase(state, CopyPhase::ReceivingFiles);
                self.stats.lock().transfers_started += 1;
                CopyResponse::SegmentsInfo(SegmentsInfoResponse { file_names: needed })
            }
            Err(response) => {
                self.set_phase(state, CopyPhase::Idle);
                response
            }
        }
    }

    fn accept_announcement(
        &self,
        state: &mut ReceiverState,
        source_node: &str,
        request: &SegmentsInfoRequest,
    ) -> std::result::Result<Transfer, CopyResponse> {
        let shard_id = self.shard.shard_id();

        let highest_term = state.highest_term.max(self.shard.primary_term());
        if request.primary_term < highest_term {
            return Err(self.reject(
                CopyErrorType::PrimaryTerm,
                format!(
                    "Primary term {} of {} is older than {} for {}",
                    request.primary_term, source_node, highest_term, shard_id
                ),
            ));
        }
        state.highest_term = request.primary_term;
        self.shard.update_primary_term(request.primary_term);

        let info = request
            .to_copy_info()
            .map_err(|e| self.reject(CopyErrorType::Shard, e.to_string()))?;
        let mut seen = HashSet::new();
        for file in &info.files {
            validate_file_name(&file.name)
                .map_err(|e| self.reject(CopyErrorType::Shard, e.to_string()))?;
            if !seen.insert(file.name.as_str()) {
                return Err(self.reject(
                    CopyErrorType::Shard,
                    format!("Duplicate file {} in announcement", file.name),
                ));
            }
        }

        let local_version = state.last_version.max(self.store.version());
        if info.version <= local_version {
            return Err(self.reject(
                CopyErrorType::SegmentsInfoVersion,
                format!(
                    "Announced version {} is not newer than local version {} of {}",
                    info.version, local_version, shard_id
                ),
            ));
        }

        let local_files = self.store.committed_file_names();
        let files: HashMap<String, IncomingFile> = info
            .files
            .iter()
            .filter(|f| !local_files.contains(&f.name))
            .map(|f| (f.name.clone(), IncomingFile::new(f.clone())))
            .collect();
        if files.is_empty() {
            return Err(self.reject(
                CopyErrorType::NoFilesNeedCopy,
                format!(
                    "Shard {} already has every file of version {}",
                    shard_id, info.version
                ),
            ));
        }

        Ok(Transfer {
            source_node: source_node.to_string(),
            info,
            files,
            declared: false,
            last_activity: Instant::now(),
        })
    }

    async fn on_files_info(
        &self,
        state: &mut ReceiverState,
        source_node: &str,
        request: CopyFilesInfoRequest,
    ) -> CopyResponse {
        if let Err(response) = self.check_open(state, source_node, request.action_name()) {
            return response;
        }
        let Some(transfer) = state.transfer.as_mut() else {
            return self.out_of_order(request.action_name());
        };

        let mismatch = if request.file_names.len() != request.file_sizes.len() {
            Some("file names and sizes differ in length".to_string())
        } else if request.file_names.len() != transfer.files.len() {
            Some(format!(
                "{} files declared, {} needed",
                request.file_names.len(),
                transfer.files.len()
            ))
        } else {
            request
                .file_names
                .iter()
                .zip(&request.file_sizes)
                .find_map(|(name, &size)| match transfer.files.get(name) {
                    None => Some(format!("{} was not requested", name)),
                    Some(f) if f.meta.length != size => Some(format!(
                        "{} declared with {} bytes, announced with {}",
                        name, size, f.meta.length
                    )),
                    Some(_) => None,
                })
        };
        if let Some(reason) = mismatch {
            return self.abort(state, &reason).await;
        }

        let mut failure = None;
        for file in transfer.files.values_mut() {
            if file.temp.is_some() {
                continue;
            }
            match self.store.create_temp(&file.meta.name).await {
                Ok(temp) => file.temp = Some(temp),
                Err(e) => {
                    failure = Some(format!("staging {} failed: {}", file.meta.name, e));
                    break;
                }
            }
        }
        if let Some(reason) = failure {
            return self.abort(state, &reason).await;
        }

        transfer.declared = true;
        transfer.last_activity = Instant::now();
        tracing::debug!(
            "Staging {} files for {} ({} reused)",
            request.file_names.len(),
            self.shard.shard_id(),
            request.existing_file_names.len()
        );
        CopyResponse::Ack {
            request_seq_no: request.request_seq_no,
        }
    }

    async fn on_file_chunk(
        &self,
        state: &mut ReceiverState,
        source_node: &str,
        request: CopyFileChunkRequest,
    ) -> CopyResponse {
        if let Err(response) = self.check_open(state, source_node, request.action_name()) {
            return response;
        }
        let Some(transfer) = state.transfer.as_mut() else {
            return self.out_of_order(request.action_name());
        };
        if !transfer.declared {
            return self.abort(state, "file chunk before files info").await;
        }

        let name = request.file_metadata.name.clone();
        let Some(file) = transfer.files.get_mut(&name) else {
            return self.abort(state, &format!("chunk for unexpected file {}", name)).await;
        };
        if file.meta != request.file_metadata {
            return self.abort(state, &format!("metadata of {} changed mid-transfer", name)).await;
        }

        let len = request.content.len() as u64;
        let end = match request.position.checked_add(len) {
            Some(end) if end <= file.meta.length => end,
            _ => {
                let reason = format!(
                    "chunk of {} bytes at {} beyond end of {} ({} bytes)",
                    len, request.position, name, file.meta.length
                );
                return self.abort(state, &reason).await;
            }
        };
        if file.chunks.get(&request.position) == Some(&len) {
            tracing::trace!("Ignoring duplicate chunk of {} at {}", name, request.position);
            return CopyResponse::Ack {
                request_seq_no: request.request_seq_no,
            };
        }
        if file.overlaps(request.position, end) {
            return self.abort(
                state,
                &format!("chunk of {} at {} overlaps a received chunk", name, request.position),
            )
            .await;
        }

        let Some(temp) = file.temp.clone() else {
            return self.abort(state, &format!("{} has no staging file", name)).await;
        };
        let written = self
            .store
            .write_temp_chunk(&temp, request.position, &request.content)
            .await;
        if let Err(e) = written {
            tracing::error!("Writing chunk of {} failed: {}", name, e);
            return self.abort(state, &format!("writing {} failed: {}", name, e)).await;
        }
        file.chunks.insert(request.position, len);
        file.received += len;
        self.stats.lock().bytes_received += len;

        if file.received == file.meta.length && !file.verified {
            let verified = self.store.verify_temp(&temp, &file.meta).await;
            if let Err(e) = verified {
                return self.abort(state, &format!("verification failed: {}", e)).await;
            }
            file.verified = true;
            self.stats.lock().files_received += 1;
            tracing::debug!(
                "Received {} ({} bytes) for {}",
                name,
                file.meta.length,
                self.shard.shard_id()
            );
        }

        transfer.last_activity = Instant::now();
        CopyResponse::Ack {
            request_seq_no: request.request_seq_no,
        }
    }

    async fn on_clean_files(
        &self,
        state: &mut ReceiverState,
        source_node: &str,
        request: CopyCleanFilesRequest,
    ) -> CopyResponse {
        if let Err(response) = self.check_open(state, source_node, request.action_name()) {
            return response;
        }
        self.set_phase(state, CopyPhase::Cleaning);
        let Some(transfer) = state.transfer.as_ref() else {
            self.set_phase(state, CopyPhase::Idle);
            return self.out_of_order(request.action_name());
        };

        if request.file_metadata_map != transfer.info.metadata_map() {
            return self.abort(state, "clean files map differs from the announced commit").await;
        }
        if let Some(missing) = transfer.files.values().find(|f| !f.verified) {
            let reason = format!(
                "{} incomplete: {} of {} bytes",
                missing.meta.name, missing.received, missing.meta.length
            );
            return self.abort(state, &reason).await;
        }

        let renames: HashMap<String, String> = transfer
            .files
            .values()
            .filter_map(|f| f.temp.clone().map(|t| (f.meta.name.clone(), t)))
            .collect();
        let info = transfer.info.clone();
        let version = info.version;
        let copied = renames.len();
        if let Err(e) = self.publish(renames, info).await {
            tracing::error!("Publishing {} version {} failed: {}", self.shard.shard_id(), version, e);
            return self.abort(state, &format!("publish failed: {}", e)).await;
        }

        self.shard.update_global_checkpoint(request.global_checkpoint);
        state.last_version = version;
        self.last_version.store(version, Ordering::SeqCst);
        state.transfer = None;
        self.set_phase(state, CopyPhase::Idle);
        self.stats.lock().transfers_completed += 1;
        tracing::info!(
            "Published {} version {} ({} files copied)",
            self.shard.shard_id(),
            version,
            copied
        );
        CopyResponse::Ack {
            request_seq_no: request.request_seq_no,
        }
    }

    /// Check that a non-announcement request belongs to the open transfer
    fn check_open(
        &self,
        state: &ReceiverState,
        source_node: &str,
        action: &str,
    ) -> std::result::Result<(), CopyResponse> {
        match &state.transfer {
            Some(t) if state.phase == CopyPhase::ReceivingFiles && t.source_node == source_node => {
                Ok(())
            }
            Some(t) if t.source_node != source_node => Err(CopyResponse::error(
                CopyErrorType::Shard,
                format!(
                    "{} from {} but {} is receiving from {}",
                    action,
                    source_node,
                    self.shard.shard_id(),
                    t.source_node
                ),
            )),
            _ => Err(self.out_of_order(action)),
        }
    }

    fn out_of_order(&self, action: &str) -> CopyResponse {
        CopyResponse::error(
            CopyErrorType::Shard,
            format!(
                "{} received while {} has no open transfer",
                action,
                self.shard.shard_id()
            ),
        )
    }

    fn reject(&self, error_type: CopyErrorType, message: String) -> CopyResponse {
        self.stats.lock().announcements_rejected += 1;
        if error_type.is_expected() {
            tracing::debug!("Rejecting announcement: {} ({})", error_type, message);
        } else {
            tracing::warn!("Rejecting announcement: {} ({})", error_type, message);
        }
        CopyResponse::error(error_type, message)
    }

    /// Drop the open transfer and its staging files
    async fn abort(&self, state: &mut ReceiverState, reason: &str) -> CopyResponse {
        if let Some(transfer) = self.take_transfer(state, reason) {
            self.discard(transfer.temps()).await;
        }
        CopyResponse::error(
            CopyErrorType::Shard,
            format!("Transfer of {} aborted: {}", self.shard.shard_id(), reason),
        )
    }

    fn take_transfer(&self, state: &mut ReceiverState, reason: &str) -> Option<Transfer> {
        let transfer = state.transfer.take();
        if let Some(transfer) = &transfer {
            self.stats.lock().transfers_aborted += 1;
            tracing::warn!(
                "Aborted transfer of {} version {} from {}: {}",
                self.shard.shard_id(),
                transfer.info.version,
                transfer.source_node,
                reason
            );
        }
        self.set_phase(state, CopyPhase::Idle);
        transfer
    }

    /// Rename staged files into place on the blocking pool
    async fn publish(&self, renames: HashMap<String, String>, info: SegmentsCopyInfo) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.publish(&renames, info))
            .await
            .map_err(|e| Error::internal(format!("publish task failed: {}", e)))?
    }

    async fn discard(&self, temps: Vec<String>) {
        if temps.is_empty() {
            return;
        }
        let store = self.store.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || store.discard_temps(&temps)).await {
            tracing::warn!(
                "Discarding staging files of {} failed: {}",
                self.shard.shard_id(),
                e
            );
        }
    }

    fn set_phase(&self, state: &mut ReceiverState, phase: CopyPhase) {
        state.phase = phase;
        self.running.store(phase != CopyPhase::Idle, Ordering::SeqCst);
    }

    /// Stop accepting requests and discard any open transfer
    ///
    /// If a request is being applied right now, its handler discards the
    /// transfer once it finishes.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(transfer) = self.take_transfer(&mut state, "shard closed") {
                let temps = transfer.temps();
                let store = self.store.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn_blocking(move || store.discard_temps(&temps));
                    }
                    Err(_) => store.discard_temps(&temps),
                }
            }
        }
        tracing::debug!("Closed receiver of {}", self.shard.shard_id());
    }
}

trait ActionName {
    fn action_name(&self) -> &'static str;
}

impl ActionName for CopyFilesInfoRequest {
    fn action_name(&self) -> &'static str {
        "files_info"
    }
}

impl ActionName for CopyFileChunkRequest {
    fn action_name(&self) -> &'static str {
        "file_chunk"
    }
}

impl ActionName for CopyCleanFilesRequest {
    fn action_name(&self) -> &'static str {
        "clean_files"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{ShardId, UNASSIGNED_CHECKPOINT};
    use crate::testing::{TestContext, segment_shard};
    use bytes::Bytes;

    const SOURCE: &str = "primary";

    fn meta(name: &str, data: &[u8]) -> StoreFileMetadata {
        StoreFileMetadata::new(name, data.len() as u64, crc32fast::hash(data))
    }

    fn info(version: u64, primary_term: u64, files: &[(&str, &[u8])]) -> SegmentsCopyInfo {
        SegmentsCopyInfo {
            version,
            generation: version,
            primary_term,
            infos_bytes: vec![version as u8],
            files: files.iter().map(|(n, d)| meta(n, d)).collect(),
        }
    }

    struct Replica {
        _ctx: TestContext,
        store: Arc<ShardStore>,
        receiver: Arc<LocalTargetShardCopyState>,
    }

    /// Receiver over a store that already published `files` as `version`
    fn replica_at(version: u64, files: &[(&str, &[u8])], settings: SegmentCopySettings) -> Replica {
        let ctx = TestContext::new();
        let store = ShardStore::open(ctx.shard_dir("replica")).unwrap();
        for (name, data) in files {
            store.write_file(name, data).unwrap();
        }
        if version > 0 {
            store
                .publish(&HashMap::new(), info(version, 1, files))
                .unwrap();
        }
        let shard = segment_shard(ShardId::new("idx", 0), store.clone(), false);
        let receiver = LocalTargetShardCopyState::new(shard, store.clone(), &settings);
        Replica {
            _ctx: ctx,
            store,
            receiver,
        }
    }

    fn announce(seq: u64, info: &SegmentsCopyInfo) -> CopyRequest {
        CopyRequest::SegmentsInfo(SegmentsInfoRequest::from_snapshot(
            seq,
            ShardId::new("idx", 0),
            SOURCE,
            info.primary_term,
            info,
        ))
    }

    fn files_info(seq: u64, files: &[(&str, &[u8])]) -> CopyRequest {
        CopyRequest::FilesInfo(CopyFilesInfoRequest {
            request_seq_no: seq,
            shard_id: ShardId::new("idx", 0),
            file_names: files.iter().map(|(n, _)| n.to_string()).collect(),
            file_sizes: files.iter().map(|(_, d)| d.len() as u64).collect(),
            existing_file_names: vec![],
            existing_file_sizes: vec![],
        })
    }

    fn chunk(seq: u64, name: &str, data: &[u8], position: usize, len: usize) -> CopyRequest {
        let end = (position + len).min(data.len());
        CopyRequest::FileChunk(CopyFileChunkRequest {
            request_seq_no: seq,
            shard_id: ShardId::new("idx", 0),
            file_metadata: meta(name, data),
            position: position as u64,
            content: Bytes::copy_from_slice(&data[position..end]),
            last_chunk: end == data.len(),
            total_translog_ops: 0,
            source_throttle_nanos: 0,
        })
    }

    fn clean(seq: u64, info: &SegmentsCopyInfo, global_checkpoint: i64) -> CopyRequest {
        CopyRequest::CleanFiles(CopyCleanFilesRequest {
            request_seq_no: seq,
            shard_id: ShardId::new("idx", 0),
            file_metadata_map: info.metadata_map(),
            global_checkpoint,
        })
    }

    fn needed(response: CopyResponse) -> Vec<String> {
        match response {
            CopyResponse::SegmentsInfo(r) => r.file_names,
            other => panic!("expected segments info response, got {:?}", other),
        }
    }

    fn staged_files(store: &ShardStore) -> usize {
        std::fs::read_dir(store.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(crate::store::TEMP_PREFIX)
            })
            .count()
    }

    fn assert_ack(response: CopyResponse) {
        assert!(
            matches!(response, CopyResponse::Ack { .. }),
            "expected ack, got {:?}",
            response
        );
    }

    #[tokio::test]
    async fn test_transfer_stages_then_publishes() {
        let a: &[u8] = b"segment a";
        let b: &[u8] = &[3u8; 1000];
        let replica = replica_at(1, &[("a", a)], SegmentCopySettings::default());
        let receiver = &replica.receiver;
        let next = info(2, 1, &[("a", a), ("b", b)]);

        assert_eq!(needed(receiver.handle(SOURCE, announce(1, &next)).await), vec!["b"]);
        assert!(receiver.is_running());
        assert_eq!(receiver.phase().await, CopyPhase::ReceivingFiles);

        assert_ack(receiver.handle(SOURCE, files_info(2, &[("b", b)])).await);
        // Out of order chunks are fine
        assert_ack(receiver.handle(SOURCE, chunk(3, "b", b, 600, 400)).await);
        assert_ack(receiver.handle(SOURCE, chunk(4, "b", b, 0, 600)).await);
        // Not visible before the commit is published
        assert!(!replica.store.file_exists("b"));

        assert_ack(receiver.handle(SOURCE, clean(5, &next, 42)).await);
        assert!(!receiver.is_running());
        assert_eq!(receiver.last_version(), 2);
        assert_eq!(replica.store.version(), 2);
        assert!(replica.store.file_exists("b"));
        assert_eq!(receiver.shard().global_checkpoint(), 42);

        let stats = receiver.stats();
        assert_eq!(stats.transfers_started, 1);
        assert_eq!(stats.transfers_completed, 1);
        assert_eq!(stats.files_received, 1);
        assert_eq!(stats.bytes_received, 1000);
    }

    #[tokio::test]
    async fn test_announcement_scenario() {
        let (a, b, c): (&[u8], &[u8], &[u8]) = (b"aaa", b"bbbb", b"ccccc");
        let replica = replica_at(3, &[("a", a), ("b", b)], SegmentCopySettings::default());
        let receiver = &replica.receiver;

        let v5 = info(5, 1, &[("a", a), ("b", b), ("c", c)]);
        assert_eq!(needed(receiver.handle(SOURCE, announce(1, &v5)).await), vec!["c"]);

        // Second announcement while the first is open
        let response = receiver.handle(SOURCE, announce(2, &v5)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::IsRunning));

        assert_ack(receiver.handle(SOURCE, files_info(3, &[("c", c)])).await);
        assert_ack(receiver.handle(SOURCE, chunk(4, "c", c, 0, c.len())).await);
        assert_ack(receiver.handle(SOURCE, clean(5, &v5, 0)).await);

        let v4 = info(4, 1, &[("a", a), ("b", b), ("d", b"d")]);
        let response = receiver.handle(SOURCE, announce(6, &v4)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::SegmentsInfoVersion));
        assert!(!receiver.is_running());
    }

    #[tokio::test]
    async fn test_no_files_need_copy() {
        let (a, b): (&[u8], &[u8]) = (b"aaa", b"bbbb");
        let replica = replica_at(3, &[("a", a), ("b", b)], SegmentCopySettings::default());

        let v5 = info(5, 1, &[("a", a), ("b", b)]);
        let response = replica.receiver.handle(SOURCE, announce(1, &v5)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::NoFilesNeedCopy));
        assert_eq!(replica.receiver.phase().await, CopyPhase::Idle);
        assert_eq!(replica.receiver.stats().announcements_rejected, 1);
    }

    #[tokio::test]
    async fn test_stale_term_checked_before_version() {
        let replica = replica_at(3, &[("a", b"a")], SegmentCopySettings::default());
        replica.receiver.shard().update_primary_term(4);

        // Both stale term and stale version: the term wins
        let stale = info(2, 3, &[("z", b"z")]);
        let response = replica.receiver.handle(SOURCE, announce(1, &stale)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::PrimaryTerm));

        // A newer term is adopted by the shard
        let newer = info(9, 6, &[("z", b"z")]);
        needed(replica.receiver.handle(SOURCE, announce(2, &newer)).await);
        assert_eq!(replica.receiver.shard().primary_term(), 6);
    }

    #[tokio::test]
    async fn test_retried_request_replays_response() {
        let replica = replica_at(1, &[("a", b"a")], SegmentCopySettings::default());
        let receiver = &replica.receiver;
        let v2 = info(2, 1, &[("a", b"a"), ("b", b"bb")]);

        let first = receiver.handle(SOURCE, announce(7, &v2)).await;
        let second = receiver.handle(SOURCE, announce(7, &v2)).await;
        assert_eq!(first, second);
        assert_eq!(needed(second), vec!["b"]);
        assert_eq!(receiver.stats().duplicate_requests, 1);
        assert_eq!(receiver.stats().transfers_started, 1);

        // Same sequence number from another node is a different request
        let other = receiver.handle("other-primary", announce(7, &v2)).await;
        assert_eq!(other.error_type(), Some(CopyErrorType::IsRunning));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_ignored_and_overlap_aborts() {
        let data: &[u8] = &[9u8; 100];
        let replica = replica_at(1, &[("a", b"a")], SegmentCopySettings::default());
        let receiver = &replica.receiver;
        let v2 = info(2, 1, &[("a", b"a"), ("big", data)]);

        needed(receiver.handle(SOURCE, announce(1, &v2)).await);
        assert_ack(receiver.handle(SOURCE, files_info(2, &[("big", data)])).await);
        assert_ack(receiver.handle(SOURCE, chunk(3, "big", data, 0, 50)).await);
        // Same range under a fresh sequence number
        assert_ack(receiver.handle(SOURCE, chunk(4, "big", data, 0, 50)).await);
        assert_eq!(receiver.stats().bytes_received, 50);

        let response = receiver.handle(SOURCE, chunk(5, "big", data, 25, 50)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
        assert!(!receiver.is_running());
        assert_eq!(receiver.stats().transfers_aborted, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_discards_staging() {
        let data: &[u8] = b"expected contents";
        let replica = replica_at(1, &[("a", b"a")], SegmentCopySettings::default());
        let receiver = &replica.receiver;
        let v2 = info(2, 1, &[("a", b"a"), ("f", data)]);

        needed(receiver.handle(SOURCE, announce(1, &v2)).await);
        assert_ack(receiver.handle(SOURCE, files_info(2, &[("f", data)])).await);

        let mut corrupt = chunk(3, "f", data, 0, data.len());
        if let CopyRequest::FileChunk(r) = &mut corrupt {
            r.content = Bytes::from(vec![0u8; data.len()]);
        }
        let response = receiver.handle(SOURCE, corrupt).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
        assert_eq!(receiver.phase().await, CopyPhase::Idle);

        assert_eq!(staged_files(&replica.store), 0);

        // The primary can start over
        assert_eq!(needed(receiver.handle(SOURCE, announce(4, &v2)).await), vec!["f"]);
    }

    #[tokio::test]
    async fn test_clean_files_requires_every_file() {
        let (x, y): (&[u8], &[u8]) = (b"xx", b"yyy");
        let replica = replica_at(1, &[("a", b"a")], SegmentCopySettings::default());
        let receiver = &replica.receiver;
        let v2 = info(2, 1, &[("x", x), ("y", y)]);

        needed(receiver.handle(SOURCE, announce(1, &v2)).await);
        assert_ack(receiver.handle(SOURCE, files_info(2, &[("x", x), ("y", y)])).await);
        assert_ack(receiver.handle(SOURCE, chunk(3, "x", x, 0, x.len())).await);

        let response = receiver.handle(SOURCE, clean(4, &v2, 5)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
        assert_eq!(replica.store.version(), 1);
        assert_eq!(receiver.shard().global_checkpoint(), UNASSIGNED_CHECKPOINT);
    }

    #[tokio::test]
    async fn test_requests_outside_transfer_rejected() {
        let data: &[u8] = b"data";
        let replica = replica_at(1, &[("a", b"a")], SegmentCopySettings::default());
        let receiver = &replica.receiver;

        let response = receiver.handle(SOURCE, chunk(1, "f", data, 0, 4)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));

        let v2 = info(2, 1, &[("f", data)]);
        needed(receiver.handle(SOURCE, announce(2, &v2)).await);

        // A different node cannot disturb the open transfer
        let response = receiver.handle("intruder", files_info(3, &[("f", data)])).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
        assert!(receiver.is_running());
        assert_ack(receiver.handle(SOURCE, files_info(4, &[("f", data)])).await);
    }

    #[tokio::test]
    async fn test_inactive_transfer_expires() {
        let settings = SegmentCopySettings::default()
            .with_timeouts(Duration::from_millis(1), Duration::from_millis(1));
        let replica = replica_at(1, &[("a", b"a")], settings);
        let receiver = &replica.receiver;

        let v2 = info(2, 1, &[("b", b"b")]);
        needed(receiver.handle("dead-primary", announce(1, &v2)).await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Same term, so only inactivity lets the announcement through
        let v3 = info(3, 1, &[("c", b"c")]);
        assert_eq!(needed(receiver.handle(SOURCE, announce(1, &v3)).await), vec!["c"]);
        assert_eq!(receiver.stats().transfers_aborted, 1);
    }

    #[tokio::test]
    async fn test_higher_term_supersedes_open_transfer() {
        let data: &[u8] = &[7u8; 64];
        let replica = replica_at(1, &[("a", b"a")], SegmentCopySettings::default());
        let receiver = &replica.receiver;

        let v2 = info(2, 1, &[("a", b"a"), ("old", data)]);
        needed(receiver.handle("old-primary", announce(1, &v2)).await);
        assert_ack(receiver.handle("old-primary", files_info(2, &[("old", data)])).await);
        assert_ack(receiver.handle("old-primary", chunk(3, "old", data, 0, 32)).await);
        assert_eq!(staged_files(&replica.store), 1);

        // Same term from another node still waits for the open transfer
        let v3 = info(3, 1, &[("a", b"a"), ("new", data)]);
        let response = receiver.handle("new-primary", announce(1, &v3)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::IsRunning));

        let v3 = info(3, 2, &[("a", b"a"), ("new", data)]);
        assert_eq!(
            needed(receiver.handle("new-primary", announce(2, &v3)).await),
            vec!["new"]
        );
        assert_eq!(receiver.stats().transfers_aborted, 1);
        assert_eq!(staged_files(&replica.store), 0);
        assert_eq!(receiver.shard().primary_term(), 2);

        // The fenced primary can no longer touch the shard
        let response = receiver.handle("old-primary", chunk(4, "old", data, 32, 32)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));

        assert_ack(receiver.handle("new-primary", files_info(3, &[("new", data)])).await);
        assert_ack(receiver.handle("new-primary", chunk(4, "new", data, 0, data.len())).await);
        assert_ack(receiver.handle("new-primary", clean(5, &v3, 0)).await);
        assert_eq!(replica.store.version(), 3);
    }

    #[tokio::test]
    async fn test_chunk_position_overflow_aborts() {
        let data: &[u8] = b"data";
        let replica = replica_at(1, &[("a", b"a")], SegmentCopySettings::default());
        let receiver = &replica.receiver;
        let v2 = info(2, 1, &[("a", b"a"), ("f", data)]);

        needed(receiver.handle(SOURCE, announce(1, &v2)).await);
        assert_ack(receiver.handle(SOURCE, files_info(2, &[("f", data)])).await);

        let mut far = chunk(3, "f", data, 0, data.len());
        if let CopyRequest::FileChunk(r) = &mut far {
            r.position = u64::MAX - 1;
        }
        let response = receiver.handle(SOURCE, far).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
        assert!(!receiver.is_running());
        assert_eq!(receiver.stats().transfers_aborted, 1);
        assert_eq!(staged_files(&replica.store), 0);

        assert_eq!(needed(receiver.handle(SOURCE, announce(4, &v2)).await), vec!["f"]);
    }

    #[tokio::test]
    async fn test_close_discards_open_transfer() {
        let replica = replica_at(1, &[("a", b"a")], SegmentCopySettings::default());
        let receiver = &replica.receiver;
        let v2 = info(2, 1, &[("b", b"b")]);
        needed(receiver.handle(SOURCE, announce(1, &v2)).await);

        receiver.close();
        assert!(!receiver.is_running());
        let response = receiver.handle(SOURCE, announce(2, &v2)).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
    }

    #[test]
    fn test_response_cache_evicts_oldest() {
        let mut cache = ResponseCache::new(2);
        for seq in 1..=3 {
            cache.insert(
                (SOURCE.to_string(), seq),
                CopyResponse::Ack { request_seq_no: seq },
            );
        }
        assert!(cache.get(&(SOURCE.to_string(), 1)).is_none());
        assert!(cache.get(&(SOURCE.to_string(), 3)).is_some());
    }

    #[test]
    fn test_response_cache_hit_refreshes_entry() {
        let mut cache = ResponseCache::new(2);
        let key = |seq: u64| (SOURCE.to_string(), seq);
        cache.insert(key(1), CopyResponse::Ack { request_seq_no: 1 });
        cache.insert(key(2), CopyResponse::Ack { request_seq_no: 2 });
        assert!(cache.get(&key(1)).is_some());

        cache.insert(key(3), CopyResponse::Ack { request_seq_no: 3 });
        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(2)).is_none());
    }
}
