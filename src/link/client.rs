//! Heartbeat TCP client

use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::LinkError;
use crate::config::LinkConfig;
use crate::protocol::{read_message, write_message, HeartbeatRequest, HeartbeatResponse, ProtocolError};

/// TCP keepalive idle time before probes start.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);

/// Interval between keepalive probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// One persistent connection to the coordinator.
pub struct HeartbeatClient {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
}

impl HeartbeatClient {
    pub fn new(addr: impl Into<String>, config: &LinkConfig) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            io_timeout: Duration::from_millis(config.io_timeout_ms),
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect with timeout and enable TCP keepalive. No-op when connected.
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| LinkError::ConnectTimeout(self.addr.clone()))?
            .map_err(|source| LinkError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.set_nodelay(true).ok();

        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL);
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            tracing::debug!(error = %e, "Could not enable TCP keepalive");
        }

        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut reader) = self.stream.take() {
            let _ = reader.get_mut().shutdown().await;
        }
    }

    /// Send one request and read exactly one response.
    ///
    /// Any failure drops the connection; the caller reconnects.
    pub async fn exchange(&mut self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, LinkError> {
        let result = self.exchange_inner(request).await;
        if result.is_err() {
            self.disconnect().await;
        }
        result
    }

    async fn exchange_inner(&mut self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, LinkError> {
        let io_timeout = self.io_timeout;
        let reader = self.stream.as_mut().ok_or(LinkError::NotConnected)?;

        tokio::time::timeout(io_timeout, write_message(reader.get_mut(), request))
            .await
            .map_err(|_| ProtocolError::Timeout)??;

        let response = tokio::time::timeout(io_timeout, read_message(reader))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        Ok(response)
    }
}
