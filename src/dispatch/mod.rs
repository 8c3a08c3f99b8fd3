//! Session dispatch: wiring inbound handlers to outbound handlers
//!
//! An inbound handler terminates client traffic, asks the [`Dispatcher`]
//! for a [`Ray`], and pumps its client socket against the inbound end.
//! The dispatcher runs the matching outbound handler against the other
//! end. Errors on the outbound path never cross the ray: the inbound side
//! only ever observes end of stream.

mod dispatcher;
mod registry;

pub use dispatcher::Dispatcher;
pub use registry::{
    default_registry, InboundContext, InboundFactory, OutboundContext, OutboundFactory, Registry,
};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::buf::MultiBuffer;
use crate::error::DispatchError;
use crate::net::Destination;
use crate::ray::{Ray, StreamReader, StreamWriter};

/// One proxied session as seen by the dispatch plane.
#[derive(Debug, Clone)]
pub struct Session {
    /// Where the client wants to go
    pub destination: Destination,
    /// Tag of the inbound handler that accepted the client
    pub inbound_tag: String,
    /// Client address, when the inbound knows it
    pub source: Option<SocketAddr>,
}

impl Session {
    /// Build a session for `destination` accepted by `inbound_tag`.
    #[must_use]
    pub fn new(destination: Destination, inbound_tag: impl Into<String>) -> Self {
        Self {
            destination,
            inbound_tag: inbound_tag.into(),
            source: None,
        }
    }

    /// Attach the client address.
    #[must_use]
    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }
}

/// The inbound view of a ray.
#[derive(Clone)]
pub struct InboundRay {
    ray: Ray,
}

impl std::fmt::Debug for InboundRay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRay").finish_non_exhaustive()
    }
}

impl InboundRay {
    fn new(ray: Ray) -> Self {
        Self { ray }
    }

    /// Writer carrying client payload toward the outbound.
    #[must_use]
    pub fn writer(&self) -> StreamWriter {
        StreamWriter::new(self.ray.inbound_input())
    }

    /// Reader carrying replies back toward the client.
    #[must_use]
    pub fn reader(&self) -> StreamReader {
        StreamReader::new(self.ray.inbound_output())
    }

    /// Stop feeding client payload; the outbound sees end of stream.
    pub fn close_input(&self) {
        self.ray.inbound_input().close();
    }

    /// Tear the whole session down.
    pub async fn close(&self) {
        self.ray.close().await;
    }
}

/// The outbound view of a ray.
#[derive(Clone)]
pub struct OutboundRay {
    ray: Ray,
}

impl OutboundRay {
    fn new(ray: Ray) -> Self {
        Self { ray }
    }

    /// Reader carrying client payload from the inbound.
    #[must_use]
    pub fn reader(&self) -> StreamReader {
        StreamReader::new(self.ray.outbound_input())
    }

    /// Writer carrying replies back toward the client.
    #[must_use]
    pub fn writer(&self) -> StreamWriter {
        StreamWriter::new(self.ray.outbound_output())
    }

    /// Fulfil the exit contract: close the reply stream and release
    /// whatever client payload was never consumed.
    pub async fn finish(&self) {
        self.ray.outbound_output().close();
        self.ray.outbound_input().release().await;
    }
}

/// An outbound protocol implementation.
///
/// `dispatch` owns the session: it must consume (and release) the first
/// payload, and [`OutboundRay::finish`] runs when it returns, so the
/// inbound side always observes end of stream afterwards.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    /// Tag this handler is addressed by.
    fn tag(&self) -> &str;

    /// Carry one session to its destination.
    async fn dispatch(&self, session: Session, payload: MultiBuffer, ray: OutboundRay);
}

/// An inbound protocol implementation.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Tag of this inbound.
    fn tag(&self) -> &str;

    /// Start accepting clients. Resolves once the listener is bound;
    /// accepted sessions run on their own tasks.
    async fn start(self: Arc<Self>) -> Result<(), DispatchError>;

    /// Stop accepting and wind down.
    fn close(&self);
}

pub(crate) fn new_ray_pair() -> (InboundRay, OutboundRay) {
    let ray = Ray::new();
    (InboundRay::new(ray.clone()), OutboundRay::new(ray))
}
