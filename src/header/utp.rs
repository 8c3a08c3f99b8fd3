//! Fake uTP header

use rand::Rng;

use super::Authenticator;
use crate::buf::Buffer;

const UTP_OVERHEAD: usize = 4;

/// Disguises datagrams as uTP: version/type byte, extension byte, and a
/// per-instance connection id.
pub struct UtpHeader {
    header: u8,
    extension: u8,
    connection_id: u16,
}

impl UtpHeader {
    /// Create a header with a random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            header: 0x01,
            extension: 0x00,
            connection_id: rand::thread_rng().gen(),
        }
    }
}

impl Default for UtpHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for UtpHeader {
    fn overhead(&self) -> usize {
        UTP_OVERHEAD
    }

    fn seal(&self, payload: &mut Buffer) {
        payload.prepend(&self.connection_id.to_be_bytes());
        payload.prepend(&[self.header, self.extension]);
    }

    fn open(&self, payload: &mut Buffer) -> bool {
        if payload.len() < UTP_OVERHEAD {
            return false;
        }
        payload.slice_from(UTP_OVERHEAD);
        true
    }
}
