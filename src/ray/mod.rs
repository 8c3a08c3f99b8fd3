//! Ray: the duplex stream pair linking an inbound handler to an outbound
//! handler for one session
//!
//! A [`Stream`] is a bounded FIFO of pooled buffers with close semantics:
//! writes block while the channel is full, fail after close, and reads
//! return end-of-stream once the closed channel drains. A [`Ray`] is two
//! streams viewed from both ends — what the inbound side writes, the
//! outbound side reads, and vice versa. Closing either end is enough to
//! unwind every task pumping the session.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::buf::{Buffer, MultiBuffer, Reader, TimeoutReader, Writer};

/// Buffers a stream holds before writers block.
pub const STREAM_CAPACITY: usize = 128;

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

/// A bounded FIFO of buffers with close/release semantics.
pub struct Stream {
    tx: parking_lot::Mutex<Option<mpsc::Sender<Buffer>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Buffer>>,
    closed: AtomicBool,
}

impl Stream {
    /// Create an open stream.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        Arc::new(Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue one buffer, waiting for channel space. Fails once the stream
    /// is closed.
    pub async fn write(&self, data: Buffer) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        let sender = self.tx.lock().clone();
        match sender {
            Some(tx) => tx.send(data).await.map_err(|_| closed_error()),
            None => Err(closed_error()),
        }
    }

    /// Queue every buffer of a sequence, in order.
    pub async fn write_multi(&self, data: MultiBuffer) -> io::Result<()> {
        for buf in data {
            self.write(buf).await?;
        }
        Ok(())
    }

    /// Take the next buffer, waiting until one arrives or the stream is
    /// closed and drained. `None` is end of stream.
    pub async fn read(&self) -> Option<Buffer> {
        self.rx.lock().await.recv().await
    }

    /// Like [`read`](Stream::read), bounded by `timeout`.
    pub async fn read_timeout(&self, timeout: Duration) -> io::Result<Option<Buffer>> {
        match tokio::time::timeout(timeout, self.read()).await {
            Ok(v) => Ok(v),
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    /// Refuse further writes. Buffers already queued remain readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().take();
    }

    /// Close and discard everything still queued, returning the buffers
    /// to their pools. Readers observe end of stream immediately.
    pub async fn release(&self) {
        self.close();
        let mut rx = self.rx.lock().await;
        while let Ok(mut buf) = rx.try_recv() {
            buf.release();
        }
    }

    /// Whether [`close`](Stream::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Read adapter over one stream end.
pub struct StreamReader(Arc<Stream>);

impl StreamReader {
    /// Wrap a stream for reading.
    #[must_use]
    pub fn new(stream: Arc<Stream>) -> Self {
        Self(stream)
    }
}

#[async_trait]
impl Reader for StreamReader {
    async fn read(&mut self) -> io::Result<Option<MultiBuffer>> {
        Ok(self.0.read().await.map(MultiBuffer::from))
    }
}

#[async_trait]
impl TimeoutReader for StreamReader {
    async fn read_timeout(&mut self, timeout: Duration) -> io::Result<Option<MultiBuffer>> {
        Ok(self.0.read_timeout(timeout).await?.map(MultiBuffer::from))
    }
}

/// Write adapter over one stream end.
pub struct StreamWriter(Arc<Stream>);

impl StreamWriter {
    /// Wrap a stream for writing.
    #[must_use]
    pub fn new(stream: Arc<Stream>) -> Self {
        Self(stream)
    }
}

#[async_trait]
impl Writer for StreamWriter {
    async fn write(&mut self, data: MultiBuffer) -> io::Result<()> {
        self.0.write_multi(data).await
    }
}

/// The duplex pair for one proxied session.
///
/// `input` carries inbound→outbound traffic, `output` carries the reply
/// direction. Both sides hold the same two streams, just swapped.
#[derive(Clone)]
pub struct Ray {
    input: Arc<Stream>,
    output: Arc<Stream>,
}

impl Ray {
    /// Create a fresh ray with both directions open.
    #[must_use]
    pub fn new() -> Self {
        Self {
            input: Stream::new(),
            output: Stream::new(),
        }
    }

    /// Stream the inbound handler writes client payload into.
    #[must_use]
    pub fn inbound_input(&self) -> Arc<Stream> {
        Arc::clone(&self.input)
    }

    /// Stream the inbound handler reads replies from.
    #[must_use]
    pub fn inbound_output(&self) -> Arc<Stream> {
        Arc::clone(&self.output)
    }

    /// Stream the outbound handler reads client payload from.
    #[must_use]
    pub fn outbound_input(&self) -> Arc<Stream> {
        Arc::clone(&self.input)
    }

    /// Stream the outbound handler writes replies into.
    #[must_use]
    pub fn outbound_output(&self) -> Arc<Stream> {
        Arc::clone(&self.output)
    }

    /// Close both directions and discard queued buffers.
    pub async fn close(&self) {
        self.input.release().await;
        self.output.release().await;
    }
}

impl Default for Ray {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_order() {
        let s = Stream::new();
        s.write(Buffer::from_bytes(b"a")).await.unwrap();
        s.write(Buffer::from_bytes(b"b")).await.unwrap();
        assert_eq!(s.read().await.unwrap().bytes(), b"a");
        assert_eq!(s.read().await.unwrap().bytes(), b"b");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let s = Stream::new();
        s.write(Buffer::from_bytes(b"x")).await.unwrap();
        s.close();
        assert!(s.write(Buffer::from_bytes(b"y")).await.is_err());
        // queued data stays readable, then end of stream
        assert_eq!(s.read().await.unwrap().bytes(), b"x");
        assert!(s.read().await.is_none());
    }

    #[tokio::test]
    async fn test_release_discards_pending() {
        let s = Stream::new();
        s.write(Buffer::from_bytes(b"gone")).await.unwrap();
        s.release().await;
        assert!(s.read().await.is_none());
        assert!(s.write(Buffer::from_bytes(b"z")).await.is_err());
    }

    #[tokio::test]
    async fn test_capacity_before_blocking() {
        // exactly STREAM_CAPACITY writes succeed without a reader
        let s = Stream::new();
        for _ in 0..STREAM_CAPACITY {
            tokio::time::timeout(Duration::from_millis(100), s.write(Buffer::from_bytes(b".")))
                .await
                .expect("write within capacity should not block")
                .unwrap();
        }
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            s.write(Buffer::from_bytes(b".")),
        )
        .await;
        assert!(blocked.is_err(), "write beyond capacity must block");
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let s = Stream::new();
        let err = s.read_timeout(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_ray_cross_wiring() {
        let ray = Ray::new();
        ray.inbound_input()
            .write(Buffer::from_bytes(b"req"))
            .await
            .unwrap();
        assert_eq!(ray.outbound_input().read().await.unwrap().bytes(), b"req");

        ray.outbound_output()
            .write(Buffer::from_bytes(b"resp"))
            .await
            .unwrap();
        assert_eq!(ray.inbound_output().read().await.unwrap().bytes(), b"resp");
    }
}
