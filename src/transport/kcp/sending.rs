//! Sending half of a KCP connection
//!
//! User payload waits in a [`SendingQueue`] until window space opens, then
//! moves into the [`SendingWindow`] as numbered in-flight segments. The
//! window drives first transmission, timeout retransmission, and fast
//! retransmission from skipped acks; the [`SendingWorker`] ties both to
//! the congestion window and the peer's acknowledgements.

use std::collections::VecDeque;

use crate::buf::{Buffer, MultiBuffer};

use super::segment::{AckSegment, DataSegment};

/// Signed distance between two u32 tick values, wraparound-safe.
fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Pre-window user data, already cut into MSS-sized payloads.
pub struct SendingQueue {
    inner: VecDeque<Buffer>,
    capacity: usize,
}

impl SendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, payload: Buffer) {
        self.inner.push_back(payload);
    }

    pub fn pop(&mut self) -> Option<Buffer> {
        self.inner.pop_front()
    }

    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn clear(&mut self) {
        for mut b in self.inner.drain(..) {
            b.release();
        }
    }
}

struct WindowEntry {
    segment: DataSegment,
    timeout: u32,
    ack_skipped: u32,
    transmitted: u32,
}

/// In-flight segments, a ring indexed by `number - first_number`.
pub struct SendingWindow {
    slots: VecDeque<Option<WindowEntry>>,
    first_number: u32,
    in_flight: usize,
}

impl SendingWindow {
    pub fn new(first_number: u32) -> Self {
        Self {
            slots: VecDeque::new(),
            first_number,
            in_flight: 0,
        }
    }

    /// Append a segment; numbers must be pushed contiguously.
    pub fn push(&mut self, segment: DataSegment) {
        debug_assert_eq!(
            segment.number,
            self.first_number.wrapping_add(self.slots.len() as u32)
        );
        self.slots.push_back(Some(WindowEntry {
            segment,
            timeout: 0,
            ack_skipped: 0,
            transmitted: 0,
        }));
        self.in_flight += 1;
    }

    /// Number of the first still-present segment, if any.
    pub fn first_number(&self) -> Option<u32> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_some() {
                return Some(self.first_number.wrapping_add(i as u32));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight == 0
    }

    /// Clear the slot holding `number`. Leading cleared slots shift out so
    /// the ring head tracks the lowest in-flight segment.
    pub fn remove(&mut self, number: u32) -> bool {
        let offset = time_diff(number, self.first_number);
        if offset < 0 || offset as usize >= self.slots.len() {
            return false;
        }
        let slot = &mut self.slots[offset as usize];
        let removed = slot.take();
        if removed.is_some() {
            self.in_flight -= 1;
        }
        self.shift_head();
        removed.is_some()
    }

    fn shift_head(&mut self) {
        while matches!(self.slots.front(), Some(None)) {
            self.slots.pop_front();
            self.first_number = self.first_number.wrapping_add(1);
        }
    }

    /// Count an ack that skipped over every in-flight segment below `number`.
    pub fn handle_fast_ack(&mut self, number: u32) {
        for slot in self.slots.iter_mut().flatten() {
            if time_diff(slot.segment.number, number) < 0 {
                slot.ack_skipped += 1;
            }
        }
    }

    /// Drop everything below `receiving_next`.
    pub fn clear(&mut self, receiving_next: u32) {
        while let Some(front) = self.slots.front_mut() {
            let number = self.first_number;
            if time_diff(number, receiving_next) >= 0 {
                break;
            }
            if front.take().is_some() {
                self.in_flight -= 1;
            }
            self.slots.pop_front();
            self.first_number = self.first_number.wrapping_add(1);
        }
        self.shift_head();
    }

    /// Drop every in-flight segment unconditionally.
    pub fn clear_all(&mut self) {
        let len = self.slots.len() as u32;
        self.slots.clear();
        self.first_number = self.first_number.wrapping_add(len);
        self.in_flight = 0;
    }

    /// Transmit and retransmit in-flight segments.
    ///
    /// Returns `(sent_any, lost_any)`: whether anything hit the wire, and
    /// whether a timeout or fast-ack retransmission signalled loss.
    pub fn flush<F>(
        &mut self,
        current: u32,
        rto: u32,
        resend_threshold: u32,
        sending_next: u32,
        mut write: F,
    ) -> (bool, bool)
    where
        F: FnMut(&DataSegment),
    {
        let mut sent = false;
        let mut lost = false;

        for slot in self.slots.iter_mut().flatten() {
            let needs_send = if slot.transmitted == 0 {
                true
            } else if time_diff(current, slot.timeout) >= 0 {
                lost = true;
                true
            } else if slot.ack_skipped >= resend_threshold {
                slot.ack_skipped = 0;
                lost = true;
                true
            } else {
                false
            };

            if needs_send {
                slot.transmitted += 1;
                slot.timeout = current.wrapping_add(rto);
                slot.segment.timestamp = current;
                slot.segment.sending_next = sending_next;
                write(&slot.segment);
                sent = true;
            }
        }

        (sent, lost)
    }
}

/// Congestion window floor, in segments.
const MIN_CONTROL_WINDOW: u32 = 4;

/// Fast-retransmit threshold: acks that may skip a segment before it is
/// resent ahead of its timer.
const FAST_RESEND_THRESHOLD: u32 = 2;

/// The sending side of one connection.
pub struct SendingWorker {
    conv: u16,
    window: SendingWindow,
    queue: SendingQueue,
    first_unacknowledged: u32,
    next_number: u32,
    remote_window_edge: Option<u32>,
    control_window: u32,
    window_size: u32,
    congestion: bool,
    mss: usize,
    updated: bool,
    closed: bool,
}

impl SendingWorker {
    pub fn new(conv: u16, window_size: u32, queue_size: usize, mss: usize, congestion: bool) -> Self {
        Self {
            conv,
            window: SendingWindow::new(0),
            queue: SendingQueue::new(queue_size),
            first_unacknowledged: 0,
            next_number: 0,
            remote_window_edge: None,
            control_window: window_size,
            window_size,
            congestion,
            mss,
            updated: false,
            closed: false,
        }
    }

    /// Move payload bytes into the sending queue, cutting them into
    /// MSS-sized segments. Returns the number of bytes accepted; the rest
    /// must be retried once the queue drains.
    pub fn push(&mut self, data: &mut MultiBuffer) -> usize {
        if self.closed {
            return 0;
        }
        let mut accepted = 0;
        while !self.queue.is_full() && !data.is_empty() {
            let mut payload = Buffer::small();
            let room = payload.unfilled();
            let take = self.mss.min(room.len());
            let n = data.read_bytes(&mut room[..take]);
            payload.advance(n);
            accepted += n;
            self.queue.push(payload);
        }
        accepted
    }

    /// Handle one Ack segment. Returns the round-trip samples it carried
    /// so the caller can feed the RTT estimator.
    pub fn process_segment(&mut self, current: u32, seg: &AckSegment) -> Vec<u32> {
        // the peer advertises the right edge of its receiving window;
        // track the furthest edge seen
        self.remote_window_edge = Some(match self.remote_window_edge {
            Some(edge) if time_diff(seg.receiving_window, edge) <= 0 => edge,
            _ => seg.receiving_window,
        });
        self.process_receiving_next(seg.receiving_next);

        let mut samples = Vec::with_capacity(seg.entries.len());
        let mut max_ack: Option<u32> = None;
        for entry in &seg.entries {
            self.process_ack(entry.number);
            let rtt = time_diff(current, entry.timestamp);
            if rtt >= 0 {
                samples.push(rtt as u32);
            }
            max_ack = Some(match max_ack {
                Some(m) if time_diff(entry.number, m) <= 0 => m,
                _ => entry.number,
            });
        }
        if let Some(max_ack) = max_ack {
            self.window.handle_fast_ack(max_ack);
        }
        samples
    }

    fn process_ack(&mut self, number: u32) {
        if time_diff(number, self.first_unacknowledged) < 0
            || time_diff(number, self.next_number) >= 0
        {
            return;
        }
        self.window.remove(number);
        self.shrink();
    }

    /// Drop everything the peer has cumulatively acknowledged.
    pub fn process_receiving_next(&mut self, receiving_next: u32) {
        self.window.clear(receiving_next);
        self.shrink();
    }

    fn shrink(&mut self) {
        let una = self
            .window
            .first_number()
            .unwrap_or(self.next_number);
        if una != self.first_unacknowledged {
            self.first_unacknowledged = una;
            self.updated = true;
        }
    }

    /// Promote queued payloads into the window up to the effective
    /// congestion limit, then transmit whatever is due.
    pub fn flush<F>(&mut self, current: u32, rto: u32, mut write: F)
    where
        F: FnMut(&DataSegment),
    {
        let mut effective = self.window_size;
        if self.congestion {
            effective = effective.min(self.control_window);
        }
        let mut limit = self.first_unacknowledged.wrapping_add(effective);
        if let Some(edge) = self.remote_window_edge {
            // never stall completely on a closed remote window: a few
            // probe segments keep the ack feedback loop alive
            let floor = self
                .first_unacknowledged
                .wrapping_add(MIN_CONTROL_WINDOW);
            let capped = if time_diff(edge, floor) < 0 { floor } else { edge };
            if time_diff(capped, limit) < 0 {
                limit = capped;
            }
        }

        while !self.queue.is_empty() && time_diff(self.next_number, limit) < 0 {
            let Some(payload) = self.queue.pop() else {
                break;
            };
            self.window.push(DataSegment {
                conv: self.conv,
                option: 0,
                timestamp: current,
                number: self.next_number,
                sending_next: self.first_unacknowledged,
                payload,
            });
            self.next_number = self.next_number.wrapping_add(1);
        }

        let had_in_flight = !self.window.is_empty();
        let (sent, lost) = self.window.flush(
            current,
            rto,
            FAST_RESEND_THRESHOLD,
            self.first_unacknowledged,
            &mut write,
        );
        if had_in_flight {
            self.adjust_control_window(lost);
        }
        if sent {
            self.updated = false;
        }
    }

    fn adjust_control_window(&mut self, lost: bool) {
        if !self.congestion {
            return;
        }
        self.control_window = if lost {
            self.control_window * 3 / 4
        } else {
            self.control_window + self.control_window / 4
        };
        self.control_window = self
            .control_window
            .clamp(MIN_CONTROL_WINDOW, self.window_size);
    }

    /// Lowest unacknowledged number; carried in pings.
    pub fn first_unacknowledged(&self) -> u32 {
        self.first_unacknowledged
    }

    /// Next number to assign.
    pub fn next_number(&self) -> u32 {
        self.next_number
    }

    /// Current congestion window, in segments.
    pub fn control_window(&self) -> u32 {
        self.control_window
    }

    /// Nothing queued and nothing in flight.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty() && self.queue.is_empty()
    }

    /// Whether the flush timer still has work.
    pub fn update_necessary(&self) -> bool {
        !self.is_empty() || self.updated
    }

    /// Dirty flag: the ping carries fresh sending state.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Drop all pending payload; entered on peer close and termination.
    pub fn close_write(&mut self) {
        self.closed = true;
        self.queue.clear();
        self.window.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::kcp::segment::AckEntry;

    fn worker() -> SendingWorker {
        SendingWorker::new(1, 32, 64, 100, false)
    }

    fn payload(n: usize) -> MultiBuffer {
        MultiBuffer::from_bytes(&vec![0xAB; n])
    }

    #[test]
    fn test_push_cuts_to_mss() {
        let mut w = worker();
        let mut data = payload(250);
        assert_eq!(w.push(&mut data), 250);
        assert_eq!(w.queue.len(), 3); // 100 + 100 + 50
    }

    #[test]
    fn test_flush_transmits_and_numbers_contiguously() {
        let mut w = worker();
        w.push(&mut payload(300));
        let mut numbers = Vec::new();
        w.flush(0, 100, |seg| numbers.push(seg.number));
        assert_eq!(numbers, vec![0, 1, 2]);
        assert_eq!(w.next_number(), 3);
        assert!(!w.is_empty());
    }

    #[test]
    fn test_ack_shrinks_window() {
        let mut w = worker();
        w.push(&mut payload(300));
        w.flush(0, 100, |_| {});

        let ack = AckSegment {
            conv: 1,
            option: 0,
            receiving_window: 32,
            receiving_next: 0,
            entries: vec![AckEntry {
                timestamp: 0,
                number: 0,
            }],
        };
        w.process_segment(10, &ack);
        assert_eq!(w.first_unacknowledged(), 1);
        assert_eq!(w.window.len(), 2);
    }

    #[test]
    fn test_receiving_next_clears_cumulatively() {
        let mut w = worker();
        w.push(&mut payload(500));
        w.flush(0, 100, |_| {});
        w.process_receiving_next(4);
        assert_eq!(w.first_unacknowledged(), 4);
        assert_eq!(w.window.len(), 1);
    }

    #[test]
    fn test_timeout_retransmission_signals_loss() {
        let mut w = SendingWorker::new(1, 32, 64, 100, true);
        let start_cwnd = w.control_window();
        w.push(&mut payload(100));
        w.flush(0, 100, |_| {});

        // past the retransmission timeout, the segment goes out again
        let mut resent = 0;
        w.flush(150, 100, |_| resent += 1);
        assert_eq!(resent, 1);
        assert!(w.control_window() < start_cwnd);
    }

    #[test]
    fn test_fast_ack_retransmission() {
        let mut w = worker();
        w.push(&mut payload(300));
        let mut first = Vec::new();
        w.flush(0, 1000, |seg| first.push(seg.number));
        assert_eq!(first.len(), 3);

        // two acks for segment 2 skip over 0 and 1
        for _ in 0..2 {
            let ack = AckSegment {
                conv: 1,
                option: 0,
                receiving_window: 32,
                receiving_next: 0,
                entries: vec![AckEntry {
                    timestamp: 0,
                    number: 2,
                }],
            };
            w.process_segment(5, &ack);
        }
        let mut resent = Vec::new();
        w.flush(10, 1000, |seg| resent.push(seg.number));
        assert_eq!(resent, vec![0, 1]);
    }

    #[test]
    fn test_congestion_window_bounds() {
        let mut w = SendingWorker::new(1, 32, 640, 100, true);
        // repeated loss floors the window at 4
        for _ in 0..20 {
            w.adjust_control_window(true);
        }
        assert_eq!(w.control_window(), 4);
        // sustained clean flushes cap it at the sending window
        for _ in 0..40 {
            w.adjust_control_window(false);
        }
        assert_eq!(w.control_window(), 32);
    }

    #[test]
    fn test_window_limits_in_flight() {
        let mut w = SendingWorker::new(1, 4, 640, 100, false);
        w.push(&mut payload(100 * 10));
        let mut sent = 0;
        w.flush(0, 100, |_| sent += 1);
        // only a window's worth may be in flight unacknowledged
        assert_eq!(sent, 4);
        assert_eq!(w.next_number(), 4);
    }

    #[test]
    fn test_close_write_clears_everything() {
        let mut w = worker();
        w.push(&mut payload(300));
        w.flush(0, 100, |_| {});
        w.close_write();
        assert!(w.is_empty());
        assert_eq!(w.push(&mut payload(10)), 0);
    }

    #[test]
    fn test_snd_una_never_exceeds_snd_nxt() {
        let mut w = worker();
        w.push(&mut payload(300));
        w.flush(0, 100, |_| {});
        w.process_receiving_next(100); // peer claims more than we ever sent
        assert!(time_diff(w.first_unacknowledged(), w.next_number()) <= 0);
    }
}
