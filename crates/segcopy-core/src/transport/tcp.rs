//! TCP transport over the framed copy protocol
//!
//! Every connection starts with a Hello/Welcome handshake that carries the
//! node IDs and protocol version. After that the connection is a strict
//! request/response channel; the sender keeps a few idle connections per
//! node so concurrent chunk sends do not serialize on one socket.

use super::{CopyRequestHandler, CopyTransport};
use crate::cluster::DiscoveryNode;
use crate::protocol::{CopyMessage, CopyRequest, CopyResponse, FailureKind, PROTOCOL_VERSION};
use crate::{Error, Result, TransportErrorKind};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const MAX_IDLE_PER_NODE: usize = 4;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sending side of the TCP transport
pub struct TcpCopyTransport {
    local_node_id: String,
    connect_timeout: Duration,
    idle: DashMap<String, Vec<TcpStream>>,
}

impl TcpCopyTransport {
    /// Create a transport identifying itself as `local_node_id`
    pub fn new(local_node_id: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            connect_timeout,
            idle: DashMap::new(),
        }
    }

    /// Drop all pooled connections to `node_id`
    pub fn disconnect(&self, node_id: &str) {
        self.idle.remove(node_id);
    }

    fn checkout(&self, node_id: &str) -> Option<TcpStream> {
        self.idle.get_mut(node_id)?.pop()
    }

    fn checkin(&self, node_id: &str, stream: TcpStream) {
        let mut idle = self.idle.entry(node_id.to_string()).or_default();
        if idle.len() < MAX_IDLE_PER_NODE {
            idle.push(stream);
        }
    }

    async fn connect(&self, node: &DiscoveryNode) -> Result<TcpStream> {
        let connect_failed =
            |detail: String| Error::transport(TransportErrorKind::ConnectFailed, detail);

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(node.addr))
            .await
            .map_err(|_| connect_failed(format!("Connect to {} ({}) timed out", node.id, node.addr)))?
            .map_err(|e| connect_failed(format!("Connect to {} ({}) failed: {}", node.id, node.addr, e)))?;
        stream.set_nodelay(true)?;

        let hello = CopyMessage::Hello {
            node_id: self.local_node_id.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        hello
            .write_to(&mut stream)
            .await
            .map_err(|e| connect_failed(format!("Handshake with {} failed: {}", node.id, e)))?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, CopyMessage::read_from(&mut stream))
            .await
            .map_err(|_| connect_failed(format!("Handshake with {} timed out", node.id)))?
            .map_err(|e| connect_failed(format!("Handshake with {} failed: {}", node.id, e)))?;

        match reply {
            CopyMessage::Welcome { node_id, .. } if node_id == node.id => {
                tracing::debug!("Connected to {} at {}", node.id, node.addr);
                Ok(stream)
            }
            CopyMessage::Welcome { node_id, .. } => Err(connect_failed(format!(
                "Expected node {} at {}, reached {}",
                node.id, node.addr, node_id
            ))),
            CopyMessage::Failure { message, .. } => Err(Error::protocol(format!(
                "Handshake with {} refused: {}",
                node.id, message
            ))),
            other => Err(Error::protocol(format!(
                "Expected Welcome from {}, got {:?}",
                node.id,
                other.message_type()
            ))),
        }
    }

    async fn round_trip(&self, node: &DiscoveryNode, request: CopyRequest) -> Result<CopyResponse> {
        let mut stream = match self.checkout(&node.id) {
            Some(stream) => stream,
            None => self.connect(node).await?,
        };

        let disconnected = |e: Error| match e {
            Error::Io(io) => Error::transport(
                TransportErrorKind::NodeDisconnected,
                format!("Connection to {} lost: {}", node.id, io),
            ),
            other => other,
        };

        CopyMessage::Request(request)
            .write_to(&mut stream)
            .await
            .map_err(disconnected)?;
        let reply = CopyMessage::read_from(&mut stream)
            .await
            .map_err(disconnected)?;

        match reply {
            CopyMessage::Response(response) => {
                self.checkin(&node.id, stream);
                Ok(response)
            }
            failure @ CopyMessage::Failure { .. } => {
                self.checkin(&node.id, stream);
                Err(failure
                    .into_failure_error()
                    .unwrap_or_else(|| Error::internal("Failure frame without error")))
            }
            other => Err(Error::protocol(format!(
                "Expected Response from {}, got {:?}",
                node.id,
                other.message_type()
            ))),
        }
    }
}

#[async_trait]
impl CopyTransport for TcpCopyTransport {
    async fn send(
        &self,
        node: &DiscoveryNode,
        request: CopyRequest,
        timeout: Duration,
    ) -> Result<CopyResponse> {
        let action = request.action();
        tokio::time::timeout(timeout, self.round_trip(node, request))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "{} to {} timed out after {:?}",
                    action, node.id, timeout
                ))
            })?
    }
}

/// Receiving side of the TCP transport
pub struct TcpCopyServer {
    node_id: String,
    handler: Arc<dyn CopyRequestHandler>,
    in_flight: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl TcpCopyServer {
    /// Create a server answering as `node_id`
    ///
    /// At most `max_in_flight_requests` requests are handled concurrently;
    /// excess requests are answered with a rejected-execution failure.
    pub fn new(
        node_id: impl Into<String>,
        handler: Arc<dyn CopyRequestHandler>,
        max_in_flight_requests: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            handler,
            in_flight: Arc::new(Semaphore::new(max_in_flight_requests)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Accept connections until [`TcpCopyServer::stop`] is called
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Copy server {} listening on {}",
            self.node_id,
            listener.local_addr()?
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.handle_connection(stream, addr).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Copy server {} shutting down", self.node_id);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop accepting and close open connections
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn handshake(&self, stream: &mut TcpStream, addr: SocketAddr) -> Option<String> {
        let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, CopyMessage::read_from(stream)).await
        {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                tracing::warn!("Failed to read Hello from {}: {}", addr, e);
                return None;
            }
            Err(_) => {
                tracing::warn!("Hello from {} timed out", addr);
                return None;
            }
        };

        let (source, version) = match hello {
            CopyMessage::Hello {
                node_id,
                protocol_version,
            } => (node_id, protocol_version),
            other => {
                tracing::warn!(
                    "Expected Hello from {}, got {:?}",
                    addr,
                    other.message_type()
                );
                return None;
            }
        };

        if version != PROTOCOL_VERSION {
            let failure = CopyMessage::Failure {
                kind: FailureKind::Internal,
                message: format!(
                    "Protocol version mismatch: expected {}, got {}",
                    PROTOCOL_VERSION, version
                ),
            };
            let _ = failure.write_to(stream).await;
            return None;
        }

        let welcome = CopyMessage::Welcome {
            node_id: self.node_id.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        if let Err(e) = welcome.write_to(stream).await {
            tracing::warn!("Failed to send Welcome to {}: {}", addr, e);
            return None;
        }
        Some(source)
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let Some(source) = self.handshake(&mut stream, addr).await else {
            return;
        };
        tracing::debug!("Copy peer {} connected from {}", source, addr);

        loop {
            let msg = tokio::select! {
                msg = CopyMessage::read_from(&mut stream) => msg,
                _ = self.shutdown.cancelled() => return,
            };

            let request = match msg {
                Ok(CopyMessage::Request(request)) => request,
                Ok(other) => {
                    tracing::warn!(
                        "Unexpected {:?} from {}, closing",
                        other.message_type(),
                        source
                    );
                    return;
                }
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("Copy peer {} disconnected", source);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Bad frame from {}: {}", source, e);
                    return;
                }
            };

            let reply = match self.in_flight.clone().try_acquire_owned() {
                Ok(_permit) => match self.handler.handle(&source, request).await {
                    Ok(response) => CopyMessage::Response(response),
                    Err(e) => {
                        tracing::warn!("Copy request from {} failed: {}", source, e);
                        CopyMessage::Failure {
                            kind: FailureKind::Internal,
                            message: e.to_string(),
                        }
                    }
                },
                Err(_) => CopyMessage::Failure {
                    kind: FailureKind::Rejected,
                    message: format!("Too many in-flight copy requests on {}", self.node_id),
                },
            };

            if let Err(e) = reply.write_to(&mut stream).await {
                tracing::debug!("Failed to answer {}: {}", source, e);
                return;
            }
        }
    }
}
