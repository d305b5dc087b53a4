//! In-process transport
//!
//! A [`LocalNetwork`] routes requests between handlers registered under node
//! IDs. It records every request and can inject transport failures, which
//! makes multi-node copy scenarios testable inside one runtime.

use super::{CopyRequestHandler, CopyTransport};
use crate::cluster::DiscoveryNode;
use crate::protocol::{CopyRequest, CopyResponse};
use crate::{Error, Result, TransportErrorKind};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// A request observed on the local network
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Sending node
    pub from: String,
    /// Receiving node
    pub to: String,
    /// The request itself
    pub request: CopyRequest,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Fail(TransportErrorKind),
    // The handler runs but the caller never sees the response
    DropResponse,
}

#[derive(Default)]
struct NetworkState {
    faults: HashMap<String, VecDeque<Fault>>,
    partitioned: HashSet<String>,
    latency: Duration,
    log: Vec<RecordedRequest>,
}

/// Shared in-process network
#[derive(Default)]
pub struct LocalNetwork {
    handlers: DashMap<String, Arc<dyn CopyRequestHandler>>,
    state: Mutex<NetworkState>,
}

impl LocalNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a handler under `node_id`
    pub fn register(&self, node_id: impl Into<String>, handler: Arc<dyn CopyRequestHandler>) {
        self.handlers.insert(node_id.into(), handler);
    }

    /// Detach the handler of `node_id`
    pub fn unregister(&self, node_id: &str) {
        self.handlers.remove(node_id);
    }

    /// Sending endpoint for `node_id`
    pub fn transport(self: &Arc<Self>, node_id: impl Into<String>) -> LocalCopyTransport {
        LocalCopyTransport {
            node_id: node_id.into(),
            network: self.clone(),
        }
    }

    /// Fail the next `count` requests to `node_id` with `kind`
    pub fn fail_next(&self, node_id: &str, count: usize, kind: TransportErrorKind) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(node_id.to_string()).or_default();
        queue.extend(std::iter::repeat_n(Fault::Fail(kind), count));
    }

    /// Deliver the next `count` requests to `node_id` but lose the responses
    pub fn drop_next_responses(&self, node_id: &str, count: usize) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(node_id.to_string()).or_default();
        queue.extend(std::iter::repeat_n(Fault::DropResponse, count));
    }

    /// Cut `node_id` off (or reconnect it)
    pub fn set_partitioned(&self, node_id: &str, partitioned: bool) {
        let mut state = self.state.lock();
        if partitioned {
            state.partitioned.insert(node_id.to_string());
        } else {
            state.partitioned.remove(node_id);
        }
    }

    /// Delay every delivery by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// All requests sent so far
    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.state.lock().log.clone()
    }

    /// Requests sent to `node_id`, in send order
    pub fn recorded_to(&self, node_id: &str) -> Vec<CopyRequest> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.to == node_id)
            .map(|r| r.request.clone())
            .collect()
    }

    /// Number of requests with the given action name
    pub fn sent_count(&self, action: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.request.action() == action)
            .count()
    }

    /// Forget recorded requests
    pub fn clear_recorded(&self) {
        self.state.lock().log.clear();
    }

    async fn deliver(&self, from: &str, to: &str, request: CopyRequest) -> Result<CopyResponse> {
        let action = request.action();
        let (fault, latency) = {
            let mut state = self.state.lock();
            state.log.push(RecordedRequest {
                from: from.to_string(),
                to: to.to_string(),
                request: request.clone(),
            });
            if state.partitioned.contains(to) {
                return Err(Error::transport(
                    TransportErrorKind::ConnectFailed,
                    format!("Node {} is partitioned", to),
                ));
            }
            let fault = state.faults.get_mut(to).and_then(|q| q.pop_front());
            (fault, state.latency)
        };

        if let Some(Fault::Fail(kind)) = fault {
            return Err(Error::transport(
                kind,
                format!("Injected failure sending {} to {}", action, to),
            ));
        }

        let handler = self
            .handlers
            .get(to)
            .map(|h| h.value().clone())
            .ok_or_else(|| {
                Error::transport(
                    TransportErrorKind::ConnectFailed,
                    format!("No route to node {}", to),
                )
            })?;

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let response = handler
            .handle(from, request)
            .await
            .map_err(|e| Error::transport(TransportErrorKind::Remote, e.to_string()))?;

        if let Some(Fault::DropResponse) = fault {
            return Err(Error::transport(
                TransportErrorKind::NodeDisconnected,
                format!("Response to {} from {} lost", action, to),
            ));
        }
        Ok(response)
    }
}

/// Sending endpoint of one node on a [`LocalNetwork`]
#[derive(Clone)]
pub struct LocalCopyTransport {
    node_id: String,
    network: Arc<LocalNetwork>,
}

impl LocalCopyTransport {
    /// The network this endpoint sends on
    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

#[async_trait]
impl CopyTransport for LocalCopyTransport {
    async fn send(
        &self,
        node: &DiscoveryNode,
        request: CopyRequest,
        timeout: Duration,
    ) -> Result<CopyResponse> {
        let action = request.action();
        tokio::time::timeout(timeout, self.network.deliver(&self.node_id, &node.id, request))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "{} to {} timed out after {:?}",
                    action, node.id, timeout
                ))
            })?
    }
}
