//! Node-wide dispatcher of inbound segment copy requests

use super::local_state::LocalTargetShardCopyState;
use crate::config::SegmentCopySettings;
use crate::protocol::{CopyErrorType, CopyRequest, CopyResponse, CopyTransportRequest};
use crate::registry::ShardRegistry;
use crate::shard::{IndexEventListener, IndexShard, IndicesService, ShardId, ShardState};
use crate::transport::{CopyRequestHandler, TcpCopyServer};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Routes inbound requests to the receiver of their shard
///
/// A receiver is created by the first announcement for a shard, and only
/// when the shard is hosted here as a replica backed by a segment copy
/// engine. Every other request needs an existing receiver.
pub struct SegmentsCopyTargetService {
    indices: Arc<IndicesService>,
    settings: SegmentCopySettings,
    receivers: ShardRegistry<LocalTargetShardCopyState>,
}

impl SegmentsCopyTargetService {
    /// Create the service over the node's shards
    pub fn new(indices: Arc<IndicesService>, settings: SegmentCopySettings) -> Arc<Self> {
        Arc::new(Self {
            indices,
            settings,
            receivers: ShardRegistry::new(),
        })
    }

    /// Receiver of a shard, if one was created
    pub fn receiver(&self, shard_id: &ShardId) -> Option<Arc<LocalTargetShardCopyState>> {
        self.receivers.get(shard_id)
    }

    /// Number of receivers
    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Answer one request from `source_node`
    pub async fn handle_request(&self, source_node: &str, request: CopyRequest) -> CopyResponse {
        let shard_id = request.shard_id().clone();

        let receiver = match &request {
            CopyRequest::SegmentsInfo(_) => {
                match self
                    .receivers
                    .get_or_try_insert(&shard_id, || self.create_receiver(&shard_id))
                {
                    Ok(receiver) => receiver,
                    Err(rejection) => return rejection,
                }
            }
            _ => match self.receivers.get(&shard_id) {
                Some(receiver) => receiver,
                None => {
                    return CopyResponse::error(
                        CopyErrorType::Shard,
                        format!(
                            "{} for {} before any announcement",
                            request.action(),
                            shard_id
                        ),
                    );
                }
            },
        };

        if receiver.shard().is_primary() {
            return CopyResponse::error(
                CopyErrorType::Shard,
                format!("Shard {} is a primary on this node", shard_id),
            );
        }
        receiver.handle(source_node, request).await
    }

    fn create_receiver(
        &self,
        shard_id: &ShardId,
    ) -> std::result::Result<Arc<LocalTargetShardCopyState>, CopyResponse> {
        let shard: Arc<IndexShard> = self.indices.shard(shard_id).ok_or_else(|| {
            CopyResponse::error(
                CopyErrorType::Shard,
                format!("Shard {} is not allocated on this node", shard_id),
            )
        })?;
        if shard.is_primary() {
            return Err(CopyResponse::error(
                CopyErrorType::Shard,
                format!("Shard {} is a primary on this node", shard_id),
            ));
        }
        if shard.state() == ShardState::Closed {
            return Err(CopyResponse::error(
                CopyErrorType::Shard,
                format!("Shard {} is closed", shard_id),
            ));
        }

        let engine = shard.engine().ok_or_else(|| {
            CopyResponse::error(
                CopyErrorType::Engine,
                format!("Shard {} has no engine yet", shard_id),
            )
        })?;
        if !engine.is_segment_copy() {
            return Err(CopyResponse::error(
                CopyErrorType::Engine,
                format!(
                    "Shard {} uses a {:?} engine, not a segment copy engine",
                    shard_id,
                    engine.kind()
                ),
            ));
        }

        tracing::info!("Created segment copy receiver for {}", shard_id);
        Ok(LocalTargetShardCopyState::new(
            shard,
            engine.store().clone(),
            &self.settings,
        ))
    }

    /// Drop the receiver of a shard, discarding any open transfer
    pub fn remove_shard(&self, shard_id: &ShardId) -> bool {
        match self.receivers.remove(shard_id) {
            Some(receiver) => {
                receiver.close();
                true
            }
            None => false,
        }
    }

    /// TCP server answering requests for this node
    pub fn tcp_server(
        self: &Arc<Self>,
        node_id: impl Into<String>,
        max_in_flight_requests: usize,
    ) -> Arc<TcpCopyServer> {
        TcpCopyServer::new(node_id, self.clone(), max_in_flight_requests)
    }
}

#[async_trait]
impl CopyRequestHandler for SegmentsCopyTargetService {
    async fn handle(&self, source_node: &str, request: CopyRequest) -> Result<CopyResponse> {
        Ok(self.handle_request(source_node, request).await)
    }
}

impl IndexEventListener for SegmentsCopyTargetService {
    fn after_shard_created(&self, _shard: &Arc<IndexShard>) {}

    fn before_shard_closed(&self, shard_id: &ShardId) {
        if self.remove_shard(shard_id) {
            tracing::debug!("Removed segment copy receiver for {}", shard_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexSettings;
    use crate::protocol::{CopyCleanFilesRequest, SegmentsInfoRequest};
    use crate::shard::{EngineKind, ShardEngine};
    use crate::store::{SegmentsCopyInfo, ShardStore, StoreFileMetadata};
    use crate::testing::{TestContext, segment_shard};
    use std::collections::BTreeMap;

    fn announcement(shard_id: ShardId, version: u64) -> CopyRequest {
        let info = SegmentsCopyInfo {
            version,
            generation: version,
            primary_term: 1,
            infos_bytes: vec![],
            files: vec![StoreFileMetadata::new("_0.cfs", 3, crc32fast::hash(b"abc"))],
        };
        CopyRequest::SegmentsInfo(SegmentsInfoRequest::from_snapshot(
            version, shard_id, "primary", 1, &info,
        ))
    }

    #[tokio::test]
    async fn test_missing_shard_creates_nothing() {
        let service = SegmentsCopyTargetService::new(IndicesService::new(), Default::default());
        let response = service
            .handle_request("primary", announcement(ShardId::new("idx", 0), 1))
            .await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
        assert_eq!(service.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_legacy_engine_rejected() {
        let ctx = TestContext::new();
        let indices = IndicesService::new();
        let shard = IndexShard::new(ShardId::new("idx", 0), IndexSettings::default(), false);
        shard.attach_engine(ShardEngine::new(
            EngineKind::Legacy,
            ShardStore::open(ctx.shard_dir("replica")).unwrap(),
        ));
        indices.add_shard(shard).unwrap();

        let service = SegmentsCopyTargetService::new(indices, Default::default());
        let response = service
            .handle_request("primary", announcement(ShardId::new("idx", 0), 1))
            .await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Engine));
        assert_eq!(service.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_first_announcement_creates_receiver() {
        let ctx = TestContext::new();
        let indices = IndicesService::new();
        let store = ShardStore::open(ctx.shard_dir("replica")).unwrap();
        indices
            .add_shard(segment_shard(ShardId::new("idx", 0), store, false))
            .unwrap();
        let service = SegmentsCopyTargetService::new(indices.clone(), Default::default());
        indices.add_listener(&service);

        let response = service
            .handle_request("primary", announcement(ShardId::new("idx", 0), 1))
            .await;
        assert!(matches!(response, CopyResponse::SegmentsInfo(_)));
        let receiver = service.receiver(&ShardId::new("idx", 0)).unwrap();
        assert!(receiver.is_running());

        // Another announcement while the transfer is open
        let response = service
            .handle_request("primary", announcement(ShardId::new("idx", 0), 2))
            .await;
        assert_eq!(response.error_type(), Some(CopyErrorType::IsRunning));

        // Closing the shard drops the receiver
        indices.remove_shard(&ShardId::new("idx", 0));
        assert_eq!(service.receiver_count(), 0);
        assert!(!receiver.is_running());
    }

    #[tokio::test]
    async fn test_request_without_receiver_is_shard_error() {
        let service = SegmentsCopyTargetService::new(IndicesService::new(), Default::default());
        let request = CopyRequest::CleanFiles(CopyCleanFilesRequest {
            request_seq_no: 1,
            shard_id: ShardId::new("idx", 0),
            file_metadata_map: BTreeMap::new(),
            global_checkpoint: 0,
        });
        let response = service.handle_request("primary", request).await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
    }

    #[tokio::test]
    async fn test_primary_does_not_receive() {
        let ctx = TestContext::new();
        let indices = IndicesService::new();
        let store = ShardStore::open(ctx.shard_dir("primary")).unwrap();
        indices
            .add_shard(segment_shard(ShardId::new("idx", 0), store, true))
            .unwrap();
        let service = SegmentsCopyTargetService::new(indices, Default::default());

        let response = service
            .handle_request("other", announcement(ShardId::new("idx", 0), 1))
            .await;
        assert_eq!(response.error_type(), Some(CopyErrorType::Shard));
    }
}
