//! Per-datagram packet headers
//!
//! An [`Authenticator`] wraps every outgoing datagram (`seal`) and
//! validates/strips every incoming one (`open`). The srtp and utp headers
//! disguise traffic as common UDP protocols; the FNV header adds an
//! integrity checksum. Datagrams that fail `open` are dropped silently by
//! the transport, never answered.

mod fnv;
mod srtp;
mod utp;

pub use fnv::FnvAuthenticator;
pub use srtp::SrtpHeader;
pub use utp::UtpHeader;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buf::Buffer;

/// A seal/open pair applied to whole datagrams.
///
/// `seal` may grow the buffer by prepending or appending wrapper bytes;
/// `open` strips them and reports whether the wrapper was well-formed.
/// `overhead` is constant per authenticator.
pub trait Authenticator: Send + Sync {
    /// Bytes added by `seal`.
    fn overhead(&self) -> usize;

    /// Wrap an outgoing datagram in place.
    fn seal(&self, payload: &mut Buffer);

    /// Validate and strip the wrapper of an incoming datagram. Returns
    /// `false` when the datagram is not well-formed; the buffer contents
    /// are then unspecified and the datagram must be discarded.
    fn open(&self, payload: &mut Buffer) -> bool;
}

/// The identity authenticator.
pub struct NoOpAuthenticator;

impl Authenticator for NoOpAuthenticator {
    fn overhead(&self) -> usize {
        0
    }

    fn seal(&self, _payload: &mut Buffer) {}

    fn open(&self, _payload: &mut Buffer) -> bool {
        true
    }
}

/// Nested authenticators: seal applies in reverse registration order,
/// open in forward order, so wrappers nest LIFO on the wire.
pub struct AuthenticatorChain {
    inner: Vec<Arc<dyn Authenticator>>,
}

impl AuthenticatorChain {
    /// Chain `inner` authenticators.
    #[must_use]
    pub fn new(inner: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { inner }
    }
}

impl Authenticator for AuthenticatorChain {
    fn overhead(&self) -> usize {
        self.inner.iter().map(|a| a.overhead()).sum()
    }

    fn seal(&self, payload: &mut Buffer) {
        for auth in self.inner.iter().rev() {
            auth.seal(payload);
        }
    }

    fn open(&self, payload: &mut Buffer) -> bool {
        self.inner.iter().all(|auth| auth.open(payload))
    }
}

/// Wire-camouflage selection, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderKind {
    /// No wrapper
    #[default]
    None,
    /// Fake SRTP header
    Srtp,
    /// Fake uTP header
    Utp,
}

/// Build the authenticator for a configured header kind.
#[must_use]
pub fn create_authenticator(kind: HeaderKind) -> Arc<dyn Authenticator> {
    match kind {
        HeaderKind::None => Arc::new(NoOpAuthenticator),
        HeaderKind::Srtp => Arc::new(SrtpHeader::new()),
        HeaderKind::Utp => Arc::new(UtpHeader::new()),
    }
}
