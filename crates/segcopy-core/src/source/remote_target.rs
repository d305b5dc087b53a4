//! Primary-side proxy for one replica

use super::SourceContext;
use crate::cluster::DiscoveryNode;
use crate::protocol::{
    CopyCleanFilesRequest, CopyFileChunkRequest, CopyFilesInfoRequest, CopyRequest, CopyResponse,
    ErrorResponse, SegmentsInfoRequest,
};
use crate::retry::retry_until;
use crate::shard::IndexShard;
use crate::store::{ShardStore, SnapshotRef, StoreFileMetadata};
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// What a finished transfer sent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Files streamed to the replica
    pub files_sent: u64,
    /// Files the replica already had
    pub files_reused: u64,
    /// Payload bytes streamed
    pub bytes_sent: u64,
    /// Time spent waiting on the throttle
    pub throttle_time: Duration,
}

/// Result of a copy round that reached the replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The replica published the commit
    Completed(TransferSummary),
    /// The replica answered with a structured rejection
    Rejected(ErrorResponse),
}

type ChunkResult = Result<Option<ErrorResponse>>;

/// Turns a snapshot into the request sequence for one replica
pub struct RemoteTargetShardCopyState {
    shard: Arc<IndexShard>,
    store: Arc<ShardStore>,
    node: DiscoveryNode,
    ctx: Arc<SourceContext>,
}

impl RemoteTargetShardCopyState {
    /// Create a proxy for the replica of `shard` on `node`
    pub fn new(
        shard: Arc<IndexShard>,
        store: Arc<ShardStore>,
        node: DiscoveryNode,
        ctx: Arc<SourceContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shard,
            store,
            node,
            ctx,
        })
    }

    /// Replica node
    pub fn node(&self) -> &DiscoveryNode {
        &self.node
    }

    /// Copy `snapshot` to the replica
    ///
    /// The whole round is bounded by the copy timeout and aborts as soon as
    /// `cancel` fires. The snapshot stays pinned until every outstanding
    /// chunk send has finished.
    pub async fn copy(
        self: &Arc<Self>,
        snapshot: Arc<SnapshotRef>,
        cancel: CancellationToken,
    ) -> Result<CopyOutcome> {
        let copy_timeout = self.ctx.settings.copy_timeout;
        let deadline = Instant::now() + copy_timeout;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled(format!(
                "Copy of {} to {} cancelled",
                self.shard.shard_id(),
                self.node.id
            ))),
            result = tokio::time::timeout(copy_timeout, self.run(snapshot, deadline, &cancel)) => {
                result.map_err(|_| Error::timeout(format!(
                    "Copy of {} to {} exceeded {:?}",
                    self.shard.shard_id(),
                    self.node.id,
                    copy_timeout
                )))?
            }
        }
    }

    async fn run(
        self: &Arc<Self>,
        snapshot: Arc<SnapshotRef>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<CopyOutcome> {
        let info = snapshot.info();
        let shard_id = self.shard.shard_id().clone();

        let announce = SegmentsInfoRequest::from_snapshot(
            self.ctx.next_seq_no(),
            shard_id.clone(),
            self.ctx.local_node_id(),
            self.shard.primary_term(),
            info,
        );
        let needed_names = match self
            .send(CopyRequest::SegmentsInfo(announce), deadline, cancel)
            .await?
        {
            CopyResponse::SegmentsInfo(response) => response.file_names,
            CopyResponse::Error(rejection) => return Ok(CopyOutcome::Rejected(rejection)),
            CopyResponse::Ack { .. } => {
                return Err(Error::protocol(format!(
                    "Replica {} acked a segments info request",
                    self.node.id
                )));
            }
        };

        let mut needed = Vec::with_capacity(needed_names.len());
        for name in &needed_names {
            let meta = info.file(name).ok_or_else(|| {
                Error::protocol(format!(
                    "Replica {} asked for {} which is not part of version {}",
                    self.node.id, name, info.version
                ))
            })?;
            needed.push(meta.clone());
        }
        needed.sort_by(|a, b| a.length.cmp(&b.length).then_with(|| a.name.cmp(&b.name)));

        let needed_set: HashSet<&str> = needed.iter().map(|f| f.name.as_str()).collect();
        let existing: Vec<&StoreFileMetadata> = info
            .files
            .iter()
            .filter(|f| !needed_set.contains(f.name.as_str()))
            .collect();

        tracing::debug!(
            "Replica {} of {} needs {} of {} files for version {}",
            self.node.id,
            shard_id,
            needed.len(),
            info.files.len(),
            info.version
        );

        let files_info = CopyFilesInfoRequest {
            request_seq_no: self.ctx.next_seq_no(),
            shard_id: shard_id.clone(),
            file_names: needed.iter().map(|f| f.name.clone()).collect(),
            file_sizes: needed.iter().map(|f| f.length).collect(),
            existing_file_names: existing.iter().map(|f| f.name.clone()).collect(),
            existing_file_sizes: existing.iter().map(|f| f.length).collect(),
        };
        if let Some(rejection) = self
            .expect_ack(CopyRequest::FilesInfo(files_info), deadline, cancel)
            .await?
        {
            return Ok(CopyOutcome::Rejected(rejection));
        }

        let mut summary = TransferSummary {
            files_reused: existing.len() as u64,
            ..Default::default()
        };
        if let Some(rejection) = self
            .send_files(&snapshot, &needed, deadline, cancel, &mut summary)
            .await?
        {
            return Ok(CopyOutcome::Rejected(rejection));
        }

        let clean_files = CopyCleanFilesRequest {
            request_seq_no: self.ctx.next_seq_no(),
            shard_id,
            file_metadata_map: info.metadata_map(),
            global_checkpoint: self.shard.global_checkpoint(),
        };
        if let Some(rejection) = self
            .expect_ack(CopyRequest::CleanFiles(clean_files), deadline, cancel)
            .await?
        {
            return Ok(CopyOutcome::Rejected(rejection));
        }

        Ok(CopyOutcome::Completed(summary))
    }

    async fn send_files(
        self: &Arc<Self>,
        snapshot: &Arc<SnapshotRef>,
        files: &[StoreFileMetadata],
        deadline: Instant,
        cancel: &CancellationToken,
        summary: &mut TransferSummary,
    ) -> Result<Option<ErrorResponse>> {
        let chunk_size = self.ctx.settings.chunk_size as u64;
        let permits = Arc::new(Semaphore::new(self.ctx.settings.max_concurrent_file_chunks));
        let mut in_flight: JoinSet<ChunkResult> = JoinSet::new();

        for file in files {
            let mut position = 0u64;
            loop {
                let len = chunk_size.min(file.length - position);
                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::internal("Chunk permits closed"))?;

                while let Some(joined) = in_flight.try_join_next() {
                    if let Some(rejection) = flatten(joined)? {
                        return Ok(Some(rejection));
                    }
                }

                let content = self
                    .store
                    .read_chunk(&file.name, position, len as usize)
                    .await?;
                if content.len() as u64 != len {
                    return Err(Error::store(format!(
                        "Short read of {} at {}: wanted {}, got {}",
                        file.name,
                        position,
                        len,
                        content.len()
                    )));
                }

                summary.throttle_time += self.ctx.rate_limiter.throttle(len).await;
                let last_chunk = position + len >= file.length;
                let request = CopyRequest::FileChunk(CopyFileChunkRequest {
                    request_seq_no: self.ctx.next_seq_no(),
                    shard_id: self.shard.shard_id().clone(),
                    file_metadata: file.clone(),
                    position,
                    content,
                    last_chunk,
                    total_translog_ops: 0,
                    source_throttle_nanos: summary.throttle_time.as_nanos() as u64,
                });

                let this = self.clone();
                let snapshot = snapshot.clone();
                let cancel = cancel.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    // Keeps the commit's files pinned while the send is outstanding
                    let _snapshot = snapshot;
                    this.expect_ack(request, deadline, &cancel).await
                });

                summary.bytes_sent += len;
                position += len;
                if last_chunk {
                    break;
                }
            }
            summary.files_sent += 1;
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Some(rejection) = flatten(joined)? {
                return Ok(Some(rejection));
            }
        }
        Ok(None)
    }

    async fn expect_ack(
        &self,
        request: CopyRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<ErrorResponse>> {
        let action = request.action();
        match self.send(request, deadline, cancel).await? {
            CopyResponse::Ack { .. } => Ok(None),
            CopyResponse::Error(rejection) => Ok(Some(rejection)),
            CopyResponse::SegmentsInfo(_) => Err(Error::protocol(format!(
                "Replica {} answered {} with a segments info response",
                self.node.id, action
            ))),
        }
    }

    /// Send with retries; every attempt carries the same sequence number
    async fn send(
        &self,
        request: CopyRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<CopyResponse> {
        let action = request.action();
        let (result, stats) = retry_until(&self.ctx.settings.retry, deadline, || {
            let request = request.clone();
            async move {
                let timeout = self
                    .ctx
                    .settings
                    .internal_action_timeout
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::cancelled(format!(
                        "{} to {} cancelled",
                        action, self.node.id
                    ))),
                    response = self.ctx.transport.send(&self.node, request, timeout) => response,
                }
            }
        })
        .await;

        if stats.total_attempts > 1 {
            match &result {
                Ok(_) => tracing::debug!(
                    "{} to {} succeeded after {} attempts ({:?})",
                    action,
                    self.node.id,
                    stats.total_attempts,
                    stats.total_retry_time
                ),
                Err(e) => tracing::warn!(
                    "{} to {} failed after {} attempts: {}",
                    action,
                    self.node.id,
                    stats.total_attempts,
                    e
                ),
            }
        }
        result
    }
}

fn flatten(joined: std::result::Result<ChunkResult, JoinError>) -> ChunkResult {
    joined.map_err(|e| Error::internal(format!("Chunk send task failed: {}", e)))?
}
