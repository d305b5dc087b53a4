//! Request/response transport between copy peers
//!
//! [`CopyTransport`] is the sending side used by the primary.
//! [`CopyRequestHandler`] is what a receiving node plugs into a server.
//! Two implementations are provided: [`TcpCopyTransport`] over the framed
//! wire protocol and [`LocalCopyTransport`] for in-process clusters.

mod local;
mod tcp;

pub use local::{LocalCopyTransport, LocalNetwork, RecordedRequest};
pub use tcp::{TcpCopyServer, TcpCopyTransport};

use crate::Result;
use crate::cluster::DiscoveryNode;
use crate::protocol::{CopyRequest, CopyResponse};
use async_trait::async_trait;
use std::time::Duration;

/// Sends copy requests to other nodes
#[async_trait]
pub trait CopyTransport: Send + Sync {
    /// Send `request` to `node` and wait at most `timeout` for the response
    ///
    /// Structured rejections come back as `Ok(CopyResponse::Error(_))`.
    /// Transport failures are returned as [`crate::Error::Transport`] or
    /// [`crate::Error::Timeout`].
    async fn send(
        &self,
        node: &DiscoveryNode,
        request: CopyRequest,
        timeout: Duration,
    ) -> Result<CopyResponse>;
}

/// Handles copy requests arriving at this node
#[async_trait]
pub trait CopyRequestHandler: Send + Sync {
    /// Process one request from `source_node`
    async fn handle(&self, source_node: &str, request: CopyRequest) -> Result<CopyResponse>;
}
