//! Wire transports
//!
//! Every transport — raw TCP, KCP over UDP, WebSocket — presents the same
//! chunked interface to the session plane: read a buffer sequence, write
//! a buffer sequence, close. Outbound handlers dial through a
//! [`TransportDialer`], inbound transports accept through a
//! [`StreamListener`]; neither side knows which wire it is on.
//!
//! ```text
//! TransportSettings
//!       |
//!       v
//! TransportDialer::dial()
//!       |
//!       v
//! Arc<dyn StreamConnection>
//!       |
//!       +-> TcpConnection  (plain TCP, reuse pool)
//!       +-> KcpStream      (reliable ARQ over UDP)
//!       +-> WsConnection   (binary WebSocket messages)
//! ```

pub mod kcp;
pub mod reuse;
mod tcp;
mod ws;

pub use tcp::TcpConnection;
pub use ws::{WsConnection, WsSettings};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use crate::buf::{MultiBuffer, Reader, TimeoutReader, Writer};
use crate::error::TransportError;
use crate::net::Destination;

use kcp::{Connection as KcpConnection, KcpConfig, KcpDialer, KcpListener};
use reuse::ConnectionPool;

/// Idle lifetime of pooled TCP connections.
const TCP_POOL_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// A bidirectional chunked byte stream over some wire.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    /// Read the next chunk. `Ok(None)` is end of stream.
    async fn read_chunk(&self) -> io::Result<Option<MultiBuffer>>;

    /// Write one chunk, consuming its buffers.
    async fn write_chunk(&self, data: MultiBuffer) -> io::Result<()>;

    /// Close the connection (or bank it for reuse when so marked).
    async fn close(&self) -> io::Result<()>;

    /// Mark the underlying socket as eligible for the reuse pool.
    fn set_reusable(&self, _reusable: bool) {}

    /// Whether the underlying socket returns to the reuse pool on close.
    fn reusable(&self) -> bool {
        false
    }
}

/// Read adapter from a shared [`StreamConnection`].
pub struct ConnectionReader(pub Arc<dyn StreamConnection>);

#[async_trait]
impl Reader for ConnectionReader {
    async fn read(&mut self) -> io::Result<Option<MultiBuffer>> {
        self.0.read_chunk().await
    }
}

#[async_trait]
impl TimeoutReader for ConnectionReader {
    async fn read_timeout(
        &mut self,
        timeout: std::time::Duration,
    ) -> io::Result<Option<MultiBuffer>> {
        match tokio::time::timeout(timeout, self.0.read_chunk()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }
}

/// Write adapter from a shared [`StreamConnection`].
pub struct ConnectionWriter(pub Arc<dyn StreamConnection>);

#[async_trait]
impl Writer for ConnectionWriter {
    async fn write(&mut self, data: MultiBuffer) -> io::Result<()> {
        self.0.write_chunk(data).await
    }
}

/// Which wire a transport endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw TCP
    #[default]
    Tcp,
    /// KCP over UDP
    Kcp,
    /// WebSocket
    Ws,
}

/// Transport selection plus per-kind options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportSettings {
    /// Selected wire
    pub kind: TransportKind,
    /// KCP options, used when `kind` is `kcp`
    pub kcp: KcpConfig,
    /// WebSocket options, used when `kind` is `ws`
    pub ws: WsSettings,
}

/// KCP connection presented through the chunked transport interface.
pub struct KcpStream(pub Arc<KcpConnection>);

#[async_trait]
impl StreamConnection for KcpStream {
    async fn read_chunk(&self) -> io::Result<Option<MultiBuffer>> {
        self.0.read().await.map_err(io::Error::from)
    }

    async fn write_chunk(&self, data: MultiBuffer) -> io::Result<()> {
        self.0.write(data).await.map_err(io::Error::from)
    }

    async fn close(&self) -> io::Result<()> {
        // closing an already-closing connection is not an error here
        let _ = self.0.close();
        Ok(())
    }

    fn set_reusable(&self, reusable: bool) {
        self.0.set_reusable(reusable);
    }

    fn reusable(&self) -> bool {
        self.0.reusable()
    }
}

/// Dials destinations over the configured transport, consulting the
/// per-destination reuse pool first.
pub struct TransportDialer {
    settings: TransportSettings,
    tcp_pool: Arc<ConnectionPool<Destination, TcpStream>>,
    kcp: KcpDialer,
}

impl TransportDialer {
    /// Create a dialer for `settings`.
    #[must_use]
    pub fn new(settings: TransportSettings) -> Self {
        let kcp = KcpDialer::new(settings.kcp.clone());
        Self {
            settings,
            tcp_pool: ConnectionPool::new(TCP_POOL_TTL),
            kcp,
        }
    }

    /// Open a stream to `dest`, bounded by `timeout`.
    pub async fn dial(
        &self,
        dest: &Destination,
        timeout: std::time::Duration,
    ) -> Result<Arc<dyn StreamConnection>, TransportError> {
        let deadline = Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.dial_inner(dest)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout {
                dest: dest.to_string(),
            }),
        }
    }

    async fn dial_inner(
        &self,
        dest: &Destination,
    ) -> Result<Arc<dyn StreamConnection>, TransportError> {
        match self.settings.kind {
            TransportKind::Tcp => {
                let conn = TcpConnection::dial(dest, &self.tcp_pool).await?;
                Ok(Arc::new(conn))
            }
            TransportKind::Kcp => {
                let addr = resolve(dest).await?;
                let conn = self
                    .kcp
                    .dial(addr)
                    .await
                    .map_err(|e| TransportError::connect_failed(dest.to_string(), e))?;
                Ok(Arc::new(KcpStream(conn)))
            }
            TransportKind::Ws => {
                let conn = ws::dial(dest, &self.settings.ws).await?;
                Ok(Arc::new(conn))
            }
        }
    }
}

async fn resolve(dest: &Destination) -> Result<SocketAddr, TransportError> {
    if let Some(addr) = dest.socket_addr() {
        return Ok(addr);
    }
    tokio::net::lookup_host(dest.host_port())
        .await
        .map_err(|e| TransportError::connect_failed(dest.to_string(), e))?
        .next()
        .ok_or_else(|| TransportError::UnsupportedDestination(dest.to_string()))
}

enum ListenerInner {
    Tcp(TcpListener),
    Kcp(KcpListener),
    Ws(TcpListener),
}

/// Accepts stream connections over the configured transport.
pub struct StreamListener {
    inner: ListenerInner,
    local_addr: SocketAddr,
}

impl StreamListener {
    /// Bind `addr` with the transport in `settings`.
    pub async fn bind(
        addr: SocketAddr,
        settings: &TransportSettings,
    ) -> Result<Self, TransportError> {
        let bind_err = |e: io::Error| TransportError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        };
        match settings.kind {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                let local_addr = listener.local_addr().map_err(bind_err)?;
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    local_addr,
                })
            }
            TransportKind::Kcp => {
                let listener = KcpListener::bind(addr, settings.kcp.clone())
                    .await
                    .map_err(|e| TransportError::Bind {
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    })?;
                let local_addr = listener.local_addr();
                Ok(Self {
                    inner: ListenerInner::Kcp(listener),
                    local_addr,
                })
            }
            TransportKind::Ws => {
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                let local_addr = listener.local_addr().map_err(bind_err)?;
                Ok(Self {
                    inner: ListenerInner::Ws(listener),
                    local_addr,
                })
            }
        }
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<Arc<dyn StreamConnection>, TransportError> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Arc::new(TcpConnection::accepted(stream)))
            }
            ListenerInner::Kcp(listener) => {
                let conn = listener
                    .accept()
                    .await
                    .map_err(|e| TransportError::Io(e.into()))?;
                Ok(Arc::new(KcpStream(conn)))
            }
            ListenerInner::Ws(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Arc::new(ws::accept(stream).await?))
            }
        }
    }

    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Address;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tcp_listener_and_dialer() {
        let settings = TransportSettings::default();
        let listener = StreamListener::bind("127.0.0.1:0".parse().unwrap(), &settings)
            .await
            .unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let chunk = conn.read_chunk().await.unwrap().unwrap();
            conn.write_chunk(chunk).await.unwrap();
        });

        let dialer = TransportDialer::new(settings);
        let dest = Destination::tcp(Address::from(addr.ip()), addr.port());
        let conn = dialer.dial(&dest, Duration::from_secs(5)).await.unwrap();
        conn.write_chunk(MultiBuffer::from_bytes(b"abc"))
            .await
            .unwrap();
        let reply = conn.read_chunk().await.unwrap().unwrap();
        assert_eq!(reply.to_vec(), b"abc");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_timeout() {
        let dialer = TransportDialer::new(TransportSettings::default());
        // RFC 5737 TEST-NET address, nothing listens there
        let dest = Destination::tcp(Address::parse("192.0.2.1"), 81);
        let err = dialer.dial(&dest, Duration::from_millis(50)).await;
        assert!(err.is_err());
    }
}
