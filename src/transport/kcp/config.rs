//! KCP tuning options
//!
//! Window sizes are derived from the configured link capacities: the
//! number of segments kept in flight is what the uplink can carry in half
//! a round of ticks, and the windows are sized at four times that.

use serde::{Deserialize, Serialize};

use super::segment::DATA_SEGMENT_OVERHEAD;
use crate::error::ConfigError;
use crate::header::HeaderKind;

/// Behavioral options for a KCP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KcpConfig {
    /// Maximum transmission unit, in bytes. Valid range 576..=1460.
    pub mtu: u32,
    /// Internal tick interval, in milliseconds. Valid range 10..=100.
    pub tti: u32,
    /// Uplink capacity in MiB/s; sizes the sending window.
    pub uplink_capacity: u32,
    /// Downlink capacity in MiB/s; sizes the receiving window.
    pub downlink_capacity: u32,
    /// Enable the congestion window.
    pub congestion: bool,
    /// Read buffer size in MiB; sizes the receiving queue.
    pub read_buffer: u32,
    /// Write buffer size in MiB; sizes the sending queue.
    pub write_buffer: u32,
    /// Per-datagram wire camouflage.
    pub header: HeaderKind,
    /// Return terminated dialer sockets to the reuse pool.
    pub connection_reuse: bool,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: 1350,
            tti: 50,
            uplink_capacity: 5,
            downlink_capacity: 20,
            congestion: false,
            read_buffer: 2,
            write_buffer: 2,
            header: HeaderKind::None,
            connection_reuse: true,
        }
    }
}

impl KcpConfig {
    /// Reject out-of-range options. Runs at startup, before any socket is
    /// bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(576..=1460).contains(&self.mtu) {
            return Err(ConfigError::validation(format!(
                "kcp mtu must be within [576, 1460], got {}",
                self.mtu
            )));
        }
        if !(10..=100).contains(&self.tti) {
            return Err(ConfigError::validation(format!(
                "kcp tti must be within [10, 100], got {}",
                self.tti
            )));
        }
        if self.uplink_capacity == 0 || self.downlink_capacity == 0 {
            return Err(ConfigError::validation(
                "kcp link capacities must be positive".to_string(),
            ));
        }
        if self.read_buffer == 0 || self.write_buffer == 0 {
            return Err(ConfigError::validation(
                "kcp read/write buffers must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Maximum segment payload once datagram and header overheads are
    /// subtracted.
    #[must_use]
    pub fn mss(&self, authenticator_overhead: usize) -> usize {
        self.mtu as usize - authenticator_overhead - DATA_SEGMENT_OVERHEAD
    }

    /// Segments the uplink can keep in flight per tick round.
    #[must_use]
    pub fn sending_in_flight_size(&self) -> u32 {
        let per_second = self.uplink_capacity * 1024 * 1024 / self.mtu;
        (per_second / (1000 / self.tti) / 2).max(8)
    }

    /// Size of the sending window, in segments.
    #[must_use]
    pub fn sending_window_size(&self) -> u32 {
        4 * self.sending_in_flight_size()
    }

    /// Size of the pre-window sending queue, in segments.
    #[must_use]
    pub fn sending_queue_size(&self) -> u32 {
        self.write_buffer * 1024 * 1024 / self.mtu
    }

    /// Segments the downlink can keep in flight per tick round.
    #[must_use]
    pub fn receiving_in_flight_size(&self) -> u32 {
        let per_second = self.downlink_capacity * 1024 * 1024 / self.mtu;
        (per_second / (1000 / self.tti) / 2).max(8)
    }

    /// Size of the receiving window, in segments.
    #[must_use]
    pub fn receiving_window_size(&self) -> u32 {
        4 * self.receiving_in_flight_size()
    }

    /// Size of the post-window receiving queue, in segments.
    #[must_use]
    pub fn receiving_queue_size(&self) -> u32 {
        self.read_buffer * 1024 * 1024 / self.mtu
    }

    /// UDP socket read buffer, in bytes.
    #[must_use]
    pub fn read_buffer_bytes(&self) -> usize {
        self.read_buffer as usize * 1024 * 1024
    }

    /// UDP socket write buffer, in bytes.
    #[must_use]
    pub fn write_buffer_bytes(&self) -> usize {
        self.write_buffer as usize * 1024 * 1024
    }
}
