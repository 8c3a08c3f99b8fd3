//! Fake SRTP header

use std::sync::atomic::{AtomicU16, Ordering};

use rand::Rng;

use super::Authenticator;
use crate::buf::Buffer;

const SRTP_OVERHEAD: usize = 4;

/// Disguises datagrams as SRTP: a two-byte version/payload-type word
/// followed by an incrementing sequence number.
pub struct SrtpHeader {
    header: u16,
    number: AtomicU16,
}

impl SrtpHeader {
    /// Create a header with a random starting sequence number.
    #[must_use]
    pub fn new() -> Self {
        Self {
            header: 0xB5E8,
            number: AtomicU16::new(rand::thread_rng().gen()),
        }
    }
}

impl Default for SrtpHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for SrtpHeader {
    fn overhead(&self) -> usize {
        SRTP_OVERHEAD
    }

    fn seal(&self, payload: &mut Buffer) {
        let number = self.number.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        payload.prepend(&number.to_be_bytes());
        payload.prepend(&self.header.to_be_bytes());
    }

    fn open(&self, payload: &mut Buffer) -> bool {
        if payload.len() < SRTP_OVERHEAD {
            return false;
        }
        payload.slice_from(SRTP_OVERHEAD);
        true
    }
}
