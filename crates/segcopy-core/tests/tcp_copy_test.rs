//! Segment copy between two nodes over real TCP connections

use segcopy_core::cluster::{DiscoveryNode, ReplicationGroup, ShardRouting, StaticClusterView};
use segcopy_core::config::SegmentCopySettings;
use segcopy_core::shard::{IndicesService, ShardId};
use segcopy_core::store::ShardStore;
use segcopy_core::testing::{TestContext, segment_shard, test_node};
use segcopy_core::transport::TcpCopyTransport;
use segcopy_core::{SegmentsCopySourceService, SegmentsCopyTargetService};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

#[tokio::test]
async fn test_copy_over_tcp() {
    let ctx = TestContext::new();
    let shard_id = ShardId::new("metrics", 2);
    let settings = SegmentCopySettings::default()
        .with_chunk_size(1024)
        .with_drive_interval(Duration::from_millis(10));

    // Replica node serving copy requests
    let replica_indices = IndicesService::new();
    let replica_store = ShardStore::open(ctx.shard_dir("n2")).unwrap();
    replica_indices
        .add_shard(segment_shard(shard_id.clone(), replica_store.clone(), false))
        .unwrap();
    let target = SegmentsCopyTargetService::new(replica_indices.clone(), settings.clone());
    replica_indices.add_listener(&target);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let replica_addr = listener.local_addr().unwrap();
    let server = target.tcp_server("n2", 16);
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    // Primary node driving copies
    let view = Arc::new(StaticClusterView::new(test_node("n1", 1)));
    view.add_node(DiscoveryNode::new("n2", replica_addr));
    view.set_replication_group(ReplicationGroup {
        primary: ShardRouting::started(shard_id.clone(), "n1", true),
        replicas: vec![ShardRouting::started(shard_id.clone(), "n2", false)],
    });
    let primary_indices = IndicesService::new();
    let source = SegmentsCopySourceService::new(
        settings,
        Arc::new(TcpCopyTransport::new("n1", Duration::from_secs(5))),
        view,
    );
    primary_indices.add_listener(&source);

    let primary_store = ShardStore::open(ctx.shard_dir("n1")).unwrap();
    let primary = segment_shard(shard_id.clone(), primary_store.clone(), true);
    primary_indices.add_shard(primary.clone()).unwrap();

    let large: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    primary_store.write_file("_0.cfs", &large).unwrap();
    primary_store.write_file("_0.si", b"segment info").unwrap();
    primary.refresh(b"infos".to_vec()).unwrap();

    let driving = {
        let source = source.clone();
        tokio::spawn(async move { source.start().await })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while replica_store.version() < 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(replica_store.version(), 1);
    assert_eq!(
        replica_store.read_chunk("_0.cfs", 0, large.len()).await.unwrap().as_ref(),
        large.as_slice()
    );
    assert_eq!(
        replica_store.latest_commit().unwrap().infos_bytes,
        b"infos".to_vec()
    );

    source.stop();
    driving.await.unwrap().unwrap();
    server.stop();
    serving.await.unwrap().unwrap();
}
