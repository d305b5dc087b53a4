//! Receiver invariants under arbitrary announcement sequences
//!
//! A model tracks the version and file set the replica should hold. Every
//! announcement is checked against it: stale versions are refused, the
//! requested files are exactly the missing ones, and a completed transfer
//! leaves the store matching the announced commit.

use bytes::Bytes;
use proptest::prelude::*;
use segcopy_core::SegmentCopySettings;
use segcopy_core::protocol::{
    CopyCleanFilesRequest, CopyErrorType, CopyFileChunkRequest, CopyFilesInfoRequest, CopyRequest,
    CopyResponse, SegmentsInfoRequest,
};
use segcopy_core::shard::ShardId;
use segcopy_core::store::{SegmentsCopyInfo, ShardStore, StoreFileMetadata};
use segcopy_core::target::LocalTargetShardCopyState;
use segcopy_core::testing::{TestContext, segment_shard};
use std::collections::HashSet;
use std::sync::Arc;

const POOL: [&str; 6] = ["_0.cfs", "_1.cfs", "_2.cfs", "_3.cfs", "_4.cfe", "_5.si"];

fn content(name: &str) -> Vec<u8> {
    format!("segment data of {}", name).repeat(3).into_bytes()
}

fn commit_info(version: u64, names: &[&str]) -> SegmentsCopyInfo {
    SegmentsCopyInfo {
        version,
        generation: version,
        primary_term: 1,
        infos_bytes: Vec::new(),
        files: names
            .iter()
            .map(|name| {
                let data = content(name);
                StoreFileMetadata::new(*name, data.len() as u64, crc32fast::hash(&data))
            })
            .collect(),
    }
}

struct Primary {
    seq: u64,
    shard_id: ShardId,
}

impl Primary {
    fn next(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn announce(&mut self, info: &SegmentsCopyInfo) -> CopyRequest {
        CopyRequest::SegmentsInfo(SegmentsInfoRequest::from_snapshot(
            self.next(),
            self.shard_id.clone(),
            "primary",
            info.primary_term,
            info,
        ))
    }

    async fn complete(
        &mut self,
        receiver: &LocalTargetShardCopyState,
        info: &SegmentsCopyInfo,
        needed: &[String],
    ) {
        let files: Vec<&StoreFileMetadata> = needed.iter().filter_map(|n| info.file(n)).collect();
        let existing: Vec<&StoreFileMetadata> = info
            .files
            .iter()
            .filter(|f| !needed.contains(&f.name))
            .collect();

        let files_info = CopyRequest::FilesInfo(CopyFilesInfoRequest {
            request_seq_no: self.next(),
            shard_id: self.shard_id.clone(),
            file_names: files.iter().map(|f| f.name.clone()).collect(),
            file_sizes: files.iter().map(|f| f.length).collect(),
            existing_file_names: existing.iter().map(|f| f.name.clone()).collect(),
            existing_file_sizes: existing.iter().map(|f| f.length).collect(),
        });
        assert!(matches!(
            receiver.handle("primary", files_info).await,
            CopyResponse::Ack { .. }
        ));

        for file in files {
            let chunk = CopyRequest::FileChunk(CopyFileChunkRequest {
                request_seq_no: self.next(),
                shard_id: self.shard_id.clone(),
                file_metadata: file.clone(),
                position: 0,
                content: Bytes::from(content(&file.name)),
                last_chunk: true,
                total_translog_ops: 0,
                source_throttle_nanos: 0,
            });
            assert!(matches!(
                receiver.handle("primary", chunk).await,
                CopyResponse::Ack { .. }
            ));
        }

        let clean = CopyRequest::CleanFiles(CopyCleanFilesRequest {
            request_seq_no: self.next(),
            shard_id: self.shard_id.clone(),
            file_metadata_map: info.metadata_map(),
            global_checkpoint: 0,
        });
        assert!(matches!(
            receiver.handle("primary", clean).await,
            CopyResponse::Ack { .. }
        ));
    }
}

fn receiver(ctx: &TestContext) -> (Arc<ShardStore>, Arc<LocalTargetShardCopyState>) {
    let store = ShardStore::open(ctx.shard_dir("replica")).unwrap();
    let shard = segment_shard(ShardId::new("idx", 0), store.clone(), false);
    let receiver =
        LocalTargetShardCopyState::new(shard, store.clone(), &SegmentCopySettings::default());
    (store, receiver)
}

fn announcement_steps() -> impl Strategy<Value = Vec<(u64, Vec<bool>)>> {
    prop::collection::vec((0u64..4, prop::collection::vec(any::<bool>(), POOL.len())), 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_receiver_follows_newest_commit(steps in announcement_steps()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let ctx = TestContext::new();
            let (store, receiver) = receiver(&ctx);
            let mut primary = Primary { seq: 0, shard_id: ShardId::new("idx", 0) };

            let mut model_version = 0u64;
            let mut model_files: HashSet<String> = HashSet::new();
            let mut announced = 0u64;

            for (step, mask) in steps {
                // A zero step re-announces an old version
                announced = if step == 0 { announced.saturating_sub(1) } else { announced + step };
                let names: Vec<&str> = POOL
                    .iter()
                    .zip(&mask)
                    .filter(|(_, keep)| **keep)
                    .map(|(name, _)| *name)
                    .collect();
                let info = commit_info(announced, &names);

                let response = receiver.handle("primary", primary.announce(&info)).await;
                let missing: Vec<String> = names
                    .iter()
                    .filter(|n| !model_files.contains(**n))
                    .map(|n| n.to_string())
                    .collect();

                if announced <= model_version {
                    assert_eq!(response.error_type(), Some(CopyErrorType::SegmentsInfoVersion));
                } else if missing.is_empty() {
                    assert_eq!(response.error_type(), Some(CopyErrorType::NoFilesNeedCopy));
                } else {
                    let CopyResponse::SegmentsInfo(accepted) = response else {
                        panic!("announcement of version {} refused", announced);
                    };
                    assert_eq!(accepted.file_names, missing);
                    primary.complete(&receiver, &info, &accepted.file_names).await;
                    model_version = announced;
                    model_files = names.iter().map(|n| n.to_string()).collect();
                }

                assert_eq!(store.version(), model_version);
                assert_eq!(receiver.last_version(), model_version);
                assert_eq!(store.committed_file_names(), model_files);
                assert!(!receiver.is_running());
            }
        });
    }
}

#[tokio::test]
async fn test_concurrent_announcements_start_one_transfer() {
    let ctx = TestContext::new();
    let (_store, receiver) = receiver(&ctx);
    let info = commit_info(1, &["_0.cfs", "_1.cfs"]);

    let handles: Vec<_> = (0..8u64)
        .map(|i| {
            let receiver = receiver.clone();
            let request = CopyRequest::SegmentsInfo(SegmentsInfoRequest::from_snapshot(
                i + 1,
                ShardId::new("idx", 0),
                "primary",
                1,
                &info,
            ));
            tokio::spawn(async move { receiver.handle("primary", request).await })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            CopyResponse::SegmentsInfo(_) => accepted += 1,
            other => assert_eq!(other.error_type(), Some(CopyErrorType::IsRunning)),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(receiver.stats().transfers_started, 1);
}
