//! Segment Copy Integration Tests
//!
//! Full primary to replica workflows on an in-process cluster:
//! - Replicas converge on the newest commit
//! - Only missing files travel
//! - Queued commits coalesce and their pins are released
//! - Lost responses are retried without being applied twice
//! - Routing changes cancel or stop transfers

use segcopy_core::config::SegmentCopySettings;
use segcopy_core::protocol::{CopyRequest, CopyTransportRequest};
use segcopy_core::retry::RetryConfig;
use segcopy_core::shard::ShardId;
use segcopy_core::testing::TestCluster;
use std::collections::HashSet;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn settings() -> SegmentCopySettings {
    SegmentCopySettings::default()
        .with_chunk_size(64)
        .with_max_bytes_per_sec(0)
        .with_retry(RetryConfig::quick())
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(20))
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn segments_info_versions(cluster: &TestCluster, node_id: &str) -> Vec<u64> {
    cluster
        .network()
        .recorded_to(node_id)
        .into_iter()
        .filter_map(|r| match r {
            CopyRequest::SegmentsInfo(r) => Some(r.version),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_replicas_converge_on_latest_commit() {
    let cluster = TestCluster::new(&["n1", "n2", "n3"], settings());
    let shard = ShardId::new("logs", 0);
    cluster.add_shard(&shard, "n1", &["n2", "n3"]);

    let segment = vec![42u8; 500];
    let v1 = cluster.commit(&shard, &[("_0.cfs", &segment), ("_0.si", b"info")]);
    for replica in ["n2", "n3"] {
        assert!(cluster.wait_for_version(replica, &shard, v1, WAIT).await);
        let store = cluster.store(replica, &shard);
        assert_eq!(
            store.read_chunk("_0.cfs", 0, 1000).await.unwrap().as_ref(),
            segment.as_slice()
        );
    }

    // Merge: new segment replaces the old one
    let primary = cluster.store("n1", &shard);
    primary.delete_file("_0.si").unwrap();
    let v2 = cluster.commit(&shard, &[("_1.cfs", b"merged segment")]);
    assert!(v2 > v1);

    for replica in ["n2", "n3"] {
        assert!(cluster.wait_for_version(replica, &shard, v2, WAIT).await);
        let store = cluster.store(replica, &shard);
        assert!(store.file_exists("_1.cfs"));
        assert!(!store.file_exists("_0.si"));
        assert_eq!(store.committed_file_names(), primary.committed_file_names());
    }
}

#[tokio::test]
async fn test_only_missing_files_are_sent() {
    let cluster = TestCluster::new(&["n1", "n2"], settings());
    let shard = ShardId::new("logs", 0);
    cluster.add_shard(&shard, "n1", &["n2"]);

    let v1 = cluster.commit(&shard, &[("_0.cfs", &[1u8; 300])]);
    assert!(cluster.wait_for_version("n2", &shard, v1, WAIT).await);
    cluster.network().clear_recorded();

    let v2 = cluster.commit(&shard, &[("_1.cfs", &[2u8; 100])]);
    assert!(cluster.wait_for_version("n2", &shard, v2, WAIT).await);

    let chunk_files: HashSet<String> = cluster
        .network()
        .recorded_to("n2")
        .into_iter()
        .filter_map(|r| match r {
            CopyRequest::FileChunk(c) => Some(c.file_metadata.name),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_files, HashSet::from(["_1.cfs".to_string()]));

    let files_info = cluster
        .network()
        .recorded_to("n2")
        .into_iter()
        .find_map(|r| match r {
            CopyRequest::FilesInfo(f) => Some(f),
            _ => None,
        })
        .unwrap();
    assert_eq!(files_info.existing_file_names, vec!["_0.cfs"]);
}

#[tokio::test]
async fn test_queued_commits_coalesce_and_release() {
    let cluster = TestCluster::new(&["n1", "n2"], settings());
    let shard = ShardId::new("logs", 0);
    cluster.add_shard(&shard, "n1", &["n2"]);

    // Promote the empty shard so later commits reach its listener
    cluster.drive();
    let state = cluster.node("n1").source.shard_state(&shard).unwrap();

    cluster.commit(&shard, &[("_0.cfs", b"zero")]);
    cluster.commit(&shard, &[("_1.cfs", b"one")]);
    let v3 = cluster.commit(&shard, &[("_2.cfs", b"two")]);
    assert_eq!(state.pending_len(), 3);

    assert!(cluster.wait_for_version("n2", &shard, v3, WAIT).await);
    assert!(segments_info_versions(&cluster, "n2").iter().all(|&v| v == v3));
    assert!(eventually(|| !state.is_copying("n2")).await);

    // Only the current snapshot still pins its files
    let primary = cluster.store("n1", &shard);
    for name in ["_0.cfs", "_1.cfs", "_2.cfs"] {
        assert_eq!(primary.ref_count(name), 1, "{}", name);
    }

    // Superseding the current snapshot lets the merged-away file go
    primary.delete_file("_0.cfs").unwrap();
    let v4 = cluster.commit(&shard, &[("_3.cfs", b"three")]);
    assert!(cluster.wait_for_version("n2", &shard, v4, WAIT).await);
    assert!(eventually(|| !state.is_copying("n2")).await);
    assert_eq!(primary.ref_count("_0.cfs"), 0);
    assert!(!primary.file_exists("_0.cfs"));
    assert_eq!(state.acked_version("n2"), v4);
}

#[tokio::test]
async fn test_lost_response_is_retried_idempotently() {
    let cluster = TestCluster::new(&["n1", "n2"], settings());
    let shard = ShardId::new("logs", 0);
    cluster.add_shard(&shard, "n1", &["n2"]);

    let v1 = cluster.commit(&shard, &[("_0.cfs", &[5u8; 200])]);
    // The announcement is applied but its response never arrives
    cluster.network().drop_next_responses("n2", 1);
    assert!(cluster.wait_for_version("n2", &shard, v1, WAIT).await);

    let announcements: Vec<u64> = cluster
        .network()
        .recorded_to("n2")
        .into_iter()
        .filter(|r| matches!(r, CopyRequest::SegmentsInfo(_)))
        .map(|r| r.request_seq_no())
        .collect();
    assert!(announcements.len() >= 2);
    assert_eq!(announcements[0], announcements[1]);

    let receiver = cluster.node("n2").target.receiver(&shard).unwrap();
    let stats = receiver.stats();
    assert_eq!(stats.transfers_started, 1);
    assert_eq!(stats.transfers_completed, 1);
    assert!(stats.duplicate_requests >= 1);
}

#[tokio::test]
async fn test_replica_leaving_cancels_transfer() {
    let cluster = TestCluster::new(&["n1", "n2"], settings());
    let shard = ShardId::new("logs", 0);
    cluster.add_shard(&shard, "n1", &["n2"]);
    cluster.network().set_latency(Duration::from_millis(50));

    cluster.commit(&shard, &[("_0.cfs", &[9u8; 2000])]);
    cluster.drive();
    let state = cluster.node("n1").source.shard_state(&shard).unwrap();
    assert!(eventually(|| state.is_copying("n2")).await);

    cluster.remove_replica(&shard, "n2");
    cluster.drive();
    assert!(!state.is_copying("n2"));
    assert!(eventually(|| state.stats().rounds_cancelled == 1).await);
    assert_eq!(state.stats().rounds_completed, 0);
    assert_eq!(cluster.store("n2", &shard).version(), 0);
}

#[tokio::test]
async fn test_demoted_primary_stops_copying() {
    let cluster = TestCluster::new(&["n1", "n2"], settings());
    let shard = ShardId::new("logs", 0);
    cluster.add_shard(&shard, "n1", &["n2"]);

    let v1 = cluster.commit(&shard, &[("_0.cfs", b"zero")]);
    assert!(cluster.wait_for_version("n2", &shard, v1, WAIT).await);

    let source = &cluster.node("n1").source;
    let state = source.shard_state(&shard).unwrap();
    cluster.shard("n1", &shard).set_primary(false);
    cluster.drive();

    assert!(state.is_closed());
    assert!(source.shard_state(&shard).is_none());
    assert_eq!(source.pending_len(), 1);
    let primary = cluster.store("n1", &shard);
    assert!(eventually(|| primary.ref_count("_0.cfs") == 0).await);

    // Still not a primary: stays staged, nothing is announced
    cluster.network().clear_recorded();
    cluster.drive();
    assert_eq!(source.pending_len(), 1);
    assert!(cluster.network().recorded().is_empty());
}

#[tokio::test]
async fn test_closed_replica_shard_rejects_copies() {
    let cluster = TestCluster::new(&["n1", "n2"], settings());
    let shard = ShardId::new("logs", 0);
    cluster.add_shard(&shard, "n1", &["n2"]);

    let v1 = cluster.commit(&shard, &[("_0.cfs", b"zero")]);
    assert!(cluster.wait_for_version("n2", &shard, v1, WAIT).await);
    assert!(cluster.node("n2").target.receiver(&shard).is_some());

    cluster.node("n2").indices.remove_shard(&shard);
    assert!(cluster.node("n2").target.receiver(&shard).is_none());

    cluster.commit(&shard, &[("_1.cfs", b"one")]);
    let state = cluster.node("n1").source.shard_state(&shard).unwrap();
    assert!(
        eventually(|| {
            cluster.drive();
            state.stats().rounds_rejected >= 1
        })
        .await
    );
    assert_eq!(state.acked_version("n2"), v1);
}
