//! Raw TCP transport to one instrument.
//!
//! A [`Connector`] opens a [`Channel`]; the session writes the whole
//! command payload once, then pulls inbound chunks until it has a
//! complete reply, and finally closes the channel. The traits exist so
//! sessions can be driven by something other than a real socket in tests.
//!
//! No retries happen here. A failed connect or write surfaces immediately.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ConnectFailure, MeasureError, MeasureResult};

/// Read size per inbound chunk.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Where an instrument listens, and how long a request may take.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentEndpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Deadline for one whole request, connect included.
    pub timeout_ms: u64,
}

impl InstrumentEndpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16, timeout_ms: u64) -> Self {
        Self {
            host: host.into(),
            port,
            timeout_ms,
        }
    }

    /// Request deadline as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `host:port`, for logs and error messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for InstrumentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An open connection to one instrument.
#[async_trait]
pub trait Channel: Send {
    /// Write and flush `bytes`.
    async fn write(&mut self, bytes: &[u8]) -> MeasureResult<()>;

    /// Next inbound chunk, or `None` once the remote has closed.
    async fn read_chunk(&mut self) -> MeasureResult<Option<Bytes>>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens channels to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Channel type produced by this connector.
    type Channel: Channel;

    /// Connect, failing with `MeasureError::Connect` after the endpoint
    /// timeout rather than hanging.
    async fn open(&self, endpoint: &InstrumentEndpoint) -> MeasureResult<Self::Channel>;
}

// =============================================================================
// TCP
// =============================================================================

/// Connector for plain TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Channel = TcpChannel;

    async fn open(&self, endpoint: &InstrumentEndpoint) -> MeasureResult<TcpChannel> {
        let address = endpoint.address();
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));

        let stream = match timeout(endpoint.timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(MeasureError::Connect {
                    reason: ConnectFailure::from_io(&err),
                    address,
                })
            }
            Err(_) => {
                return Err(MeasureError::Connect {
                    address,
                    reason: ConnectFailure::Timeout,
                })
            }
        };

        // Commands are small; send them without Nagle delay.
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed on {}: {}", address, err);
        }

        tracing::debug!("Connected to {}", address);
        Ok(TcpChannel {
            stream: Some(stream),
            address,
        })
    }
}

/// A TCP connection owned by one session.
#[derive(Debug)]
pub struct TcpChannel {
    stream: Option<TcpStream>,
    address: String,
}

impl TcpChannel {
    /// Peer address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether `close` has not been called yet.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

fn closed_error(address: &str) -> MeasureError {
    MeasureError::Connect {
        address: address.to_owned(),
        reason: ConnectFailure::Other("channel already closed".into()),
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn write(&mut self, bytes: &[u8]) -> MeasureResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(closed_error(&self.address));
        };

        let result = match stream.write_all(bytes).await {
            Ok(()) => stream.flush().await,
            Err(err) => Err(err),
        };
        result.map_err(|source| MeasureError::Write {
            address: self.address.clone(),
            source,
        })?;

        tracing::debug!("Wrote {} bytes to {}", bytes.len(), self.address);
        Ok(())
    }

    async fn read_chunk(&mut self) -> MeasureResult<Option<Bytes>> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(closed_error(&self.address));
        };

        let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);
        match stream.read_buf(&mut chunk).await {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(chunk.freeze())),
            Err(err) => Err(MeasureError::Connect {
                address: self.address.clone(),
                reason: ConnectFailure::from_io(&err),
            }),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.shutdown().await {
                tracing::debug!("Shutdown of {} reported: {}", self.address, err);
            }
            tracing::debug!("Closed connection to {}", self.address);
        }
    }
}
