//! Receiving half of a KCP connection
//!
//! Out-of-order segments land in a fixed [`ReceivingWindow`] ring indexed
//! by distance from the next expected number; contiguous head slots drain
//! into the [`ReceivingQueue`] where reads pick them up. Every accepted
//! segment is recorded in the [`AckList`] until the peer confirms it saw
//! the acknowledgement.

use std::collections::VecDeque;

use crate::buf::{Buffer, MultiBuffer};

use super::segment::{AckEntry, AckSegment, DataSegment, MAX_ACK_COUNT};

fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// Pending acknowledgements are re-sent at this pace until cleared.
const ACK_FLUSH_INTERVAL: u32 = 100;

/// Fixed ring of out-of-order segments. Slot `i` holds the segment
/// numbered `next_expected + i`.
pub struct ReceivingWindow {
    slots: Vec<Option<DataSegment>>,
    start: usize,
}

impl ReceivingWindow {
    pub fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self { slots, start: 0 }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn position(&self, offset: usize) -> usize {
        (self.start + offset) % self.slots.len()
    }

    /// Store a segment at `offset` slots past the head. Returns `false`
    /// when the slot is already occupied (duplicate delivery).
    pub fn set(&mut self, offset: usize, segment: DataSegment) -> bool {
        let pos = self.position(offset);
        if self.slots[pos].is_some() {
            return false;
        }
        self.slots[pos] = Some(segment);
        true
    }

    /// Take the head slot, if present.
    pub fn remove_first(&mut self) -> Option<DataSegment> {
        self.slots[self.start].take()
    }

    /// Rotate the head forward by one slot.
    pub fn advance(&mut self) {
        self.start = self.position(1);
    }
}

/// Contiguous, ready-to-read payload.
pub struct ReceivingQueue {
    inner: VecDeque<Buffer>,
    capacity: usize,
    closed: bool,
}

impl ReceivingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: VecDeque::new(),
            capacity,
            closed: false,
        }
    }

    /// Whether another payload buffer would be accepted.
    pub fn can_accept(&self) -> bool {
        !self.closed && self.inner.len() < self.capacity
    }

    /// Queue a payload buffer. Refused when full or closed, which stalls
    /// the window drain until the reader catches up.
    pub fn put(&mut self, payload: Buffer) -> bool {
        if !self.can_accept() {
            return false;
        }
        self.inner.push_back(payload);
        true
    }

    /// Drain everything currently queued.
    pub fn read(&mut self) -> MultiBuffer {
        let mut out = MultiBuffer::new();
        for buf in self.inner.drain(..) {
            out.push(buf);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Refuse further payload and discard what is queued.
    pub fn close(&mut self) {
        self.closed = true;
        for mut buf in self.inner.drain(..) {
            buf.release();
        }
    }
}

/// Acknowledgements owed to the peer.
pub struct AckList {
    entries: Vec<AckEntry>,
    dirty: bool,
    last_flush: u32,
}

impl AckList {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            dirty: false,
            last_flush: 0,
        }
    }

    /// Record one accepted segment.
    pub fn add(&mut self, number: u32, timestamp: u32) {
        if self.entries.iter().any(|e| e.number == number) {
            // duplicate delivery refreshes the timestamp so the echoed
            // RTT sample stays current
            for e in &mut self.entries {
                if e.number == number {
                    e.timestamp = timestamp;
                }
            }
        } else {
            self.entries.push(AckEntry { number, timestamp });
        }
        self.dirty = true;
    }

    /// Discard entries the peer no longer retransmits: everything below
    /// its reported sending-next.
    pub fn clear(&mut self, sending_next: u32) {
        let before = self.entries.len();
        self.entries
            .retain(|e| time_diff(e.number, sending_next) >= 0);
        if self.entries.len() != before {
            self.dirty = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Emit at most one Ack segment: immediately when dirty, on a slow
    /// cadence while unconfirmed entries remain. `limit` caps the number
    /// of entries so the segment fits one datagram.
    pub fn flush(
        &mut self,
        current: u32,
        conv: u16,
        limit: usize,
        receiving_window: u32,
        receiving_next: u32,
    ) -> Option<AckSegment> {
        let due = self.dirty
            || (!self.entries.is_empty()
                && time_diff(current, self.last_flush.wrapping_add(ACK_FLUSH_INTERVAL)) >= 0);
        if !due {
            return None;
        }
        self.dirty = false;
        self.last_flush = current;
        Some(AckSegment {
            conv,
            option: 0,
            receiving_window,
            receiving_next,
            entries: self
                .entries
                .iter()
                .take(limit.min(MAX_ACK_COUNT))
                .copied()
                .collect(),
        })
    }
}

/// The receiving side of one connection.
pub struct ReceivingWorker {
    conv: u16,
    window: ReceivingWindow,
    queue: ReceivingQueue,
    acklist: AckList,
    next_number: u32,
    window_size: u32,
    ack_limit: usize,
    updated: bool,
}

impl ReceivingWorker {
    pub fn new(conv: u16, window_size: u32, queue_size: usize, ack_limit: usize) -> Self {
        Self {
            conv,
            window: ReceivingWindow::new(window_size as usize),
            queue: ReceivingQueue::new(queue_size),
            acklist: AckList::new(),
            next_number: 0,
            window_size,
            ack_limit,
            updated: false,
        }
    }

    /// Handle one Data segment: window placement, ack bookkeeping, and
    /// the contiguous drain into the read queue. Out-of-window numbers
    /// are dropped without effect.
    pub fn process_segment(&mut self, segment: DataSegment) {
        let number = segment.number;
        let offset = time_diff(number, self.next_number);
        if offset < 0 || offset >= self.window_size as i32 {
            return;
        }
        self.acklist.clear(segment.sending_next);
        self.acklist.add(number, segment.timestamp);
        self.updated = true;

        if self.window.set(offset as usize, segment) {
            self.drain_window();
        }
    }

    /// The peer's sending-next from a control segment clears stale acks.
    pub fn process_sending_next(&mut self, sending_next: u32) {
        self.acklist.clear(sending_next);
    }

    fn drain_window(&mut self) {
        // the head slot stays in the window while the queue is full so no
        // payload is ever dropped between window and queue
        while self.queue.can_accept() {
            let Some(segment) = self.window.remove_first() else {
                break;
            };
            self.queue.put(segment.payload);
            self.window.advance();
            self.next_number = self.next_number.wrapping_add(1);
            self.updated = true;
        }
    }

    /// Drain ready payload. Empty result means nothing is queued yet.
    pub fn read(&mut self) -> MultiBuffer {
        let data = self.queue.read();
        if !data.is_empty() {
            self.drain_window();
        }
        data
    }

    pub fn is_data_available(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Next contiguous number expected from the peer.
    pub fn next_number(&self) -> u32 {
        self.next_number
    }

    /// Right edge of the window advertised in acknowledgements.
    pub fn window_edge(&self) -> u32 {
        self.next_number.wrapping_add(self.window_size)
    }

    /// Emit the pending acknowledgement segment, if one is due.
    pub fn flush(&mut self, current: u32) -> Option<AckSegment> {
        self.acklist.flush(
            current,
            self.conv,
            self.ack_limit,
            self.window_edge(),
            self.next_number,
        )
    }

    /// Whether the flush timer still has work.
    pub fn update_necessary(&self) -> bool {
        self.updated || self.acklist.is_dirty() || !self.acklist.is_empty()
    }

    /// Dirty flag for the ping path.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn clear_updated(&mut self) {
        self.updated = false;
    }

    /// Stop accepting payload; entered on local close and termination.
    pub fn close_read(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Buffer;

    fn data_segment(number: u32, payload: &[u8]) -> DataSegment {
        DataSegment {
            conv: 1,
            option: 0,
            timestamp: number,
            number,
            sending_next: 0,
            payload: Buffer::from_bytes(payload),
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let mut w = ReceivingWorker::new(1, 32, 64, 128);
        w.process_segment(data_segment(0, b"a"));
        w.process_segment(data_segment(1, b"b"));
        assert_eq!(w.read().to_vec(), b"ab");
        assert_eq!(w.next_number(), 2);
    }

    #[test]
    fn test_reordered_delivery() {
        let mut w = ReceivingWorker::new(1, 32, 64, 128);
        w.process_segment(data_segment(1, b"b"));
        assert!(w.read().is_empty());
        w.process_segment(data_segment(0, b"a"));
        assert_eq!(w.read().to_vec(), b"ab");
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let mut w = ReceivingWorker::new(1, 32, 64, 128);
        w.process_segment(data_segment(0, b"a"));
        w.process_segment(data_segment(0, b"A"));
        assert_eq!(w.read().to_vec(), b"a");
    }

    #[test]
    fn test_below_window_dropped() {
        let mut w = ReceivingWorker::new(1, 32, 64, 128);
        w.process_segment(data_segment(0, b"a"));
        assert_eq!(w.read().to_vec(), b"a");
        // retransmission of an already-delivered number
        w.process_segment(data_segment(0, b"a"));
        assert!(w.read().is_empty());
        assert_eq!(w.next_number(), 1);
    }

    #[test]
    fn test_beyond_window_dropped() {
        let mut w = ReceivingWorker::new(1, 4, 64, 128);
        w.process_segment(data_segment(4, b"far"));
        w.process_segment(data_segment(0, b"a"));
        assert_eq!(w.read().to_vec(), b"a");
        // number 4 was outside [0, 4) and must not have been stored
        for n in 1..4 {
            w.process_segment(data_segment(n, b"x"));
        }
        assert_eq!(w.read().len(), 3);
        assert_eq!(w.next_number(), 4);
        assert!(w.read().is_empty());
    }

    #[test]
    fn test_acks_accumulate_and_clear() {
        let mut w = ReceivingWorker::new(1, 32, 64, 128);
        w.process_segment(data_segment(0, b"a"));
        w.process_segment(data_segment(1, b"b"));

        let ack = w.flush(10).expect("ack due");
        assert_eq!(ack.entries.len(), 2);
        assert_eq!(ack.receiving_next, 2);
        assert_eq!(ack.receiving_window, 2 + 32);

        // peer advances its sending-next past both numbers
        w.process_sending_next(2);
        w.clear_updated();
        assert!(w.flush(11).is_some()); // clear marked the list dirty
        assert!(w.flush(12).is_none());
    }

    #[test]
    fn test_pending_acks_repeat_on_cadence() {
        let mut w = ReceivingWorker::new(1, 32, 64, 128);
        w.process_segment(data_segment(0, b"a"));
        assert!(w.flush(0).is_some());
        assert!(w.flush(10).is_none());
        assert!(w.flush(150).is_some());
    }

    #[test]
    fn test_close_read_discards() {
        let mut w = ReceivingWorker::new(1, 32, 64, 128);
        w.process_segment(data_segment(0, b"a"));
        w.close_read();
        assert!(w.read().is_empty());
        w.process_segment(data_segment(1, b"b"));
        assert!(w.read().is_empty());
    }
}
