//! Raw TCP stream transport

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::buf::{Buffer, MultiBuffer};
use crate::error::TransportError;
use crate::net::Destination;

use super::reuse::ConnectionPool;
use super::StreamConnection;

/// A TCP stream presented through the chunked transport interface.
///
/// When marked reusable, closing reunites the halves and banks the raw
/// stream in the per-destination pool instead of shutting it down.
pub struct TcpConnection {
    read_half: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reusable: AtomicBool,
    pool: Option<(Arc<ConnectionPool<Destination, TcpStream>>, Destination)>,
}

impl TcpConnection {
    /// Wrap an accepted stream (no reuse pool on the listen side).
    #[must_use]
    pub fn accepted(stream: TcpStream) -> Self {
        Self::wrap(stream, None)
    }

    /// Wrap a dialed stream, with the pool it may return to.
    #[must_use]
    pub fn dialed(
        stream: TcpStream,
        pool: Arc<ConnectionPool<Destination, TcpStream>>,
        dest: Destination,
    ) -> Self {
        Self::wrap(stream, Some((pool, dest)))
    }

    fn wrap(
        stream: TcpStream,
        pool: Option<(Arc<ConnectionPool<Destination, TcpStream>>, Destination)>,
    ) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Self {
            read_half: tokio::sync::Mutex::new(Some(read_half)),
            write_half: tokio::sync::Mutex::new(Some(write_half)),
            reusable: AtomicBool::new(false),
            pool,
        }
    }

    /// Dial `dest`, preferring an idle pooled stream.
    pub async fn dial(
        dest: &Destination,
        pool: &Arc<ConnectionPool<Destination, TcpStream>>,
    ) -> Result<Self, TransportError> {
        if let Some(stream) = pool.take(dest) {
            debug!("tcp: reusing pooled connection to {}", dest);
            return Ok(Self::dialed(stream, Arc::clone(pool), dest.clone()));
        }
        let stream = TcpStream::connect(dest.host_port())
            .await
            .map_err(|e| TransportError::connect_failed(dest.to_string(), e))?;
        Ok(Self::dialed(stream, Arc::clone(pool), dest.clone()))
    }
}

#[async_trait]
impl StreamConnection for TcpConnection {
    async fn read_chunk(&self) -> io::Result<Option<MultiBuffer>> {
        let mut guard = self.read_half.lock().await;
        let Some(read_half) = guard.as_mut() else {
            return Ok(None);
        };
        let mut buf = Buffer::new();
        let n = read_half.read(buf.unfilled()).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.advance(n);
        Ok(Some(MultiBuffer::from(buf)))
    }

    async fn write_chunk(&self, data: MultiBuffer) -> io::Result<()> {
        let mut guard = self.write_half.lock().await;
        let Some(write_half) = guard.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        };
        for buf in data {
            write_half.write_all(buf.bytes()).await?;
        }
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        let read_half = self.read_half.lock().await.take();
        let write_half = self.write_half.lock().await.take();
        let (Some(read_half), Some(write_half)) = (read_half, write_half) else {
            return Ok(());
        };

        if self.reusable.load(Ordering::Relaxed) {
            if let Some((pool, dest)) = &self.pool {
                if let Ok(stream) = read_half.reunite(write_half) {
                    debug!("tcp: banking connection to {} for reuse", dest);
                    pool.put(dest.clone(), stream);
                }
                return Ok(());
            }
        }
        let mut write_half = write_half;
        write_half.shutdown().await
    }

    fn set_reusable(&self, reusable: bool) {
        self.reusable.store(reusable, Ordering::Relaxed);
    }

    fn reusable(&self) -> bool {
        self.reusable.load(Ordering::Relaxed)
    }
}
