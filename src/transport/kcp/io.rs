//! Datagram assembly and the link abstraction
//!
//! Segments produced by one flush are packed back to back into datagrams
//! of at most one MTU, sealed by the configured authenticator, and handed
//! to a [`DatagramLink`]. The link is the only part that touches a real
//! socket, which keeps loss injection and loopback wiring trivial in
//! tests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::segment::SegmentEncode;
use crate::buf::Buffer;
use crate::header::Authenticator;

/// One-way datagram transmission.
#[async_trait]
pub trait DatagramLink: Send + Sync {
    /// Send one datagram. Transient failures are the caller's problem to
    /// log and survive.
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;
}

/// Link over a UDP socket: connected (dialer side) or addressed
/// (listener side, one socket shared across conversations).
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}

impl UdpLink {
    /// Link over a connected socket.
    #[must_use]
    pub fn connected(socket: Arc<UdpSocket>) -> Self {
        Self { socket, peer: None }
    }

    /// Link over a shared socket, addressed per datagram.
    #[must_use]
    pub fn addressed(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer: Some(peer),
        }
    }
}

#[async_trait]
impl DatagramLink for UdpLink {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        match self.peer {
            Some(addr) => self.socket.send_to(datagram, addr).await.map(|_| ()),
            None => self.socket.send(datagram).await.map(|_| ()),
        }
    }
}

/// Packs segments into MTU-sized datagrams and seals them.
///
/// `write` is synchronous so the flush loop can run under the connection
/// locks; sealed datagrams accumulate until [`take_ready`]
/// (`SegmentWriter::take_ready`) hands them to the async link.
pub struct SegmentWriter {
    budget: usize,
    authenticator: Arc<dyn Authenticator>,
    current: Option<Buffer>,
    ready: Vec<Buffer>,
}

impl SegmentWriter {
    /// Create a writer for `mtu`-byte datagrams wrapped by
    /// `authenticator`.
    #[must_use]
    pub fn new(mtu: usize, authenticator: Arc<dyn Authenticator>) -> Self {
        let budget = mtu - authenticator.overhead();
        Self {
            budget,
            authenticator,
            current: None,
            ready: Vec::new(),
        }
    }

    /// Append one segment, starting a new datagram when it would not fit.
    pub fn write<S: SegmentEncode>(&mut self, segment: &S) {
        let size = segment.byte_size();
        let fits = self
            .current
            .as_ref()
            .map_or(true, |b| b.len() + size <= self.budget);
        if !fits {
            self.rotate();
        }
        let buf = self.current.get_or_insert_with(Buffer::small);
        segment.encode(buf);
    }

    fn rotate(&mut self) {
        if let Some(mut datagram) = self.current.take() {
            if datagram.is_empty() {
                datagram.release();
            } else {
                self.authenticator.seal(&mut datagram);
                self.ready.push(datagram);
            }
        }
    }

    /// Seal the datagram in progress and take everything ready to send.
    pub fn take_ready(&mut self) -> Vec<Buffer> {
        self.rotate();
        std::mem::take(&mut self.ready)
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.ready.is_empty()
    }
}
