//! Heartbeat Server - coordinator side of the heartbeat protocol
//!
//! One task per station connection. Each request line is ingested into the
//! [`NodeRegistry`], its fresh touches are forwarded to the orchestrator's
//! touch channel, and exactly one acknowledgement line is written back. A
//! malformed line, an oversized line or an idle connection closes the
//! connection; the station reconnects.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{read_message, write_message, HeartbeatRequest, ProtocolError};
use crate::registry::NodeRegistry;
use crate::types::TouchEvent;

#[derive(Clone)]
pub struct HeartbeatServer {
    registry: Arc<NodeRegistry>,
    touches: mpsc::Sender<TouchEvent>,
    /// Silence after which a connection is dropped
    idle_timeout: Duration,
}

impl HeartbeatServer {
    pub fn new(registry: Arc<NodeRegistry>, touches: mpsc::Sender<TouchEvent>) -> Self {
        let idle_timeout = registry.offline_after();
        Self {
            registry,
            touches,
            idle_timeout,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Accept station connections until `cancel` fires.
    pub async fn run(self, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "📡 Heartbeat server listening");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        stream.set_nodelay(true).ok();
                        let server = self.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            server.handle_peer(stream, peer, cancel).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        info!("Heartbeat server stopped");
        Ok(())
    }

    async fn handle_peer<S>(&self, stream: S, peer: SocketAddr, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(%peer, "Station connected");
        match self.serve_connection(stream, &cancel).await {
            Ok(()) | Err(ProtocolError::Closed) => debug!(%peer, "Station disconnected"),
            Err(ProtocolError::Timeout) => info!(%peer, "Station connection idle, closing"),
            Err(e) => warn!(%peer, error = %e, "Closing station connection"),
        }
    }

    /// Serve one connection: request line in, acknowledgement line out.
    ///
    /// Returns `Ok(())` only when cancelled.
    pub async fn serve_connection<S>(&self, stream: S, cancel: &CancellationToken) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        loop {
            let request: HeartbeatRequest = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                read = tokio::time::timeout(self.idle_timeout, read_message(&mut reader)) => {
                    read.map_err(|_| ProtocolError::Timeout)??
                }
            };

            let ingested = self.registry.ingest(&request, Instant::now());
            for touch in ingested.touches {
                if self.touches.send(touch).await.is_err() {
                    warn!(node = %request.node_id, "Touch consumer gone, touch dropped");
                }
            }

            write_message(&mut write_half, &ingested.response).await?;
        }
    }
}
