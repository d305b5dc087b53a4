//! Wiring of one node: shard stores, cluster view and copy services

use crate::config::NodeConfig;
use anyhow::Context;
use segcopy_core::cluster::{DiscoveryNode, ReplicationGroup, ShardRouting, StaticClusterView};
use segcopy_core::shard::{EngineKind, IndexShard, IndicesService, ShardEngine, ShardState};
use segcopy_core::store::ShardStore;
use segcopy_core::transport::{TcpCopyServer, TcpCopyTransport};
use segcopy_core::{IndexSettings, SegmentsCopySourceService, SegmentsCopyTargetService};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// A running copy node
pub struct Node {
    config: NodeConfig,
    indices: Arc<IndicesService>,
    source: Arc<SegmentsCopySourceService>,
    target: Arc<SegmentsCopyTargetService>,
}

impl Node {
    /// Build the services and open the stores of every shard hosted here
    pub fn build(config: NodeConfig) -> anyhow::Result<Self> {
        let view = Arc::new(StaticClusterView::new(DiscoveryNode::new(
            config.node_id.clone(),
            config.bind_addr,
        )));
        for peer in config.remote_peers() {
            view.add_node(DiscoveryNode::new(peer.id.clone(), peer.addr));
        }
        for shard in &config.shards {
            view.set_replication_group(ReplicationGroup {
                primary: ShardRouting::started(shard.shard_id(), shard.primary.clone(), true),
                replicas: shard
                    .replicas
                    .iter()
                    .map(|r| ShardRouting::started(shard.shard_id(), r.clone(), false))
                    .collect(),
            });
        }

        let indices = IndicesService::new();
        let source = SegmentsCopySourceService::new(
            config.copy.clone(),
            Arc::new(TcpCopyTransport::new(
                config.node_id.clone(),
                config.connect_timeout(),
            )),
            view,
        );
        let target = SegmentsCopyTargetService::new(indices.clone(), config.copy.clone());
        indices.add_listener(&source);
        indices.add_listener(&target);

        for placement in config.shards.iter().filter(|s| s.is_hosted_on(&config.node_id)) {
            let shard_id = placement.shard_id();
            let store = ShardStore::open(config.shard_dir(&shard_id))
                .with_context(|| format!("Failed to open store of {}", shard_id))?;
            let primary = placement.primary == config.node_id;

            let shard = IndexShard::new(shard_id.clone(), IndexSettings::segment(), primary);
            indices.add_shard(shard.clone())?;
            shard.attach_engine(ShardEngine::new(EngineKind::Segment, store.clone()));
            shard.set_state(ShardState::Started);
            info!(
                "Opened {} {} at version {}",
                if primary { "primary" } else { "replica" },
                shard_id,
                store.version()
            );
        }

        Ok(Self {
            config,
            indices,
            source,
            target,
        })
    }

    /// Local shards
    pub fn indices(&self) -> &Arc<IndicesService> {
        &self.indices
    }

    /// Commit new files on every local primary
    pub fn refresh_primaries(&self) {
        for shard in self.indices.shards() {
            if !shard.is_primary() || shard.state() != ShardState::Started {
                continue;
            }
            match shard.refresh(Vec::new()) {
                Ok(true) => debug!("Refreshed {}", shard.shard_id()),
                Ok(false) => {}
                Err(e) => warn!("Failed to refresh {}: {}", shard.shard_id(), e),
            }
        }
    }

    /// Serve copy requests and drive copies until `shutdown` fires
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;
        let server: Arc<TcpCopyServer> = self
            .target
            .tcp_server(self.config.node_id.clone(), self.config.copy.max_in_flight_requests);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        let driving = {
            let source = self.source.clone();
            tokio::spawn(async move { source.start().await })
        };

        let mut refresh = tokio::time::interval(self.config.refresh_interval());
        loop {
            tokio::select! {
                _ = refresh.tick() => self.refresh_primaries(),
                _ = &mut shutdown => break,
            }
        }

        info!("Stopping node {}", self.config.node_id);
        self.source.stop();
        server.stop();
        driving.await??;
        serving.await??;

        for shard in self.indices.shards() {
            self.indices.remove_shard(shard.shard_id());
        }
        Ok(())
    }
}
