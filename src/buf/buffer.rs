//! Lock-free buffer pools
//!
//! Two pool classes coexist: a bounded pool of 8 KiB slices for stream
//! payloads, whose total size caps peak memory for high connection counts,
//! and a recycler of 2 KiB slices for datagram-sized payloads. Both are
//! backed by `crossbeam_queue::ArrayQueue`: allocation pops a slice or
//! falls back to a fresh allocation, release pushes the slice back or lets
//! it drop when the queue is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use crossbeam_queue::ArrayQueue;

/// Size of a medium buffer, used for stream reads.
pub const BUFFER_SIZE: usize = 8 * 1024;

/// Size of a small buffer, used for datagram-sized payloads.
pub const SMALL_BUFFER_SIZE: usize = 2 * 1024;

/// Headroom reserved at the front of every buffer so datagram headers can
/// be prepended without shifting payload bytes.
const HEADROOM: usize = 32;

/// Environment variable holding the medium pool size in MiB.
/// `0` disables the bounded pool and falls back to a plain recycler.
pub const POOL_SIZE_ENV: &str = "RAYNET_BUFFER_SIZE";

/// Legacy name for [`POOL_SIZE_ENV`], honored as a fallback.
pub const POOL_SIZE_ENV_LEGACY: &str = "v2ray.buffer.size";

/// Queue capacity used when the bounded pool is disabled: enough reuse to
/// stay off the allocator in steady state, without pinning memory.
const RECYCLER_CAPACITY: usize = 64;

/// Counters for pool behavior. Doubles as the release-tracking
/// instrumentation used by buffer-lifecycle tests.
#[derive(Debug, Default)]
pub struct PoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

impl PoolStats {
    /// Number of fresh heap allocations (pool was empty).
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of slices reused from the pool.
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Number of slices returned to the pool.
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Number of slices dropped because the pool was full.
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Buffers handed out and not yet returned or dropped.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        (self.allocations() + self.reuses()).saturating_sub(self.returns() + self.drops())
    }

    /// Copy the counters into a plain snapshot.
    #[must_use]
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            drops: self.drops(),
        }
    }
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy)]
pub struct PoolStatsSnapshot {
    /// Fresh heap allocations
    pub allocations: u64,
    /// Slices reused from the pool
    pub reuses: u64,
    /// Slices returned to the pool
    pub returns: u64,
    /// Slices dropped (pool full)
    pub drops: u64,
}

/// A pool of fixed-size byte slices.
#[derive(Debug)]
pub struct BufferPool {
    queue: ArrayQueue<Vec<u8>>,
    item_size: usize,
    stats: PoolStats,
}

impl BufferPool {
    /// Create a pool holding at most `capacity` slices of `item_size` bytes.
    #[must_use]
    pub fn new(capacity: usize, item_size: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            item_size,
            stats: PoolStats::default(),
        }
    }

    /// Take a buffer from the pool, allocating when the pool is empty.
    ///
    /// The buffer starts empty with a small headroom reserved for header
    /// prepends. Reused slices are not zeroed.
    #[must_use]
    pub fn allocate(self: &Arc<Self>) -> Buffer {
        let data = match self.queue.pop() {
            Some(v) => {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                v
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.item_size]
            }
        };
        Buffer {
            data: Some(data),
            pool: Some(Arc::clone(self)),
            start: HEADROOM,
            end: HEADROOM,
        }
    }

    /// Size of each slice in this pool.
    #[must_use]
    pub const fn item_size(&self) -> usize {
        self.item_size
    }

    /// Pool counters.
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn recycle(&self, data: Vec<u8>) {
        match self.queue.push(data) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn pool_size_mib() -> u64 {
    std::env::var(POOL_SIZE_ENV)
        .or_else(|_| std::env::var(POOL_SIZE_ENV_LEGACY))
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(20)
}

static MEDIUM_POOL: LazyLock<Arc<BufferPool>> = LazyLock::new(|| {
    let size = pool_size_mib();
    let capacity = if size > 0 {
        (size * 1024 * 1024) as usize / BUFFER_SIZE
    } else {
        RECYCLER_CAPACITY
    };
    Arc::new(BufferPool::new(capacity, BUFFER_SIZE))
});

static SMALL_POOL: LazyLock<Arc<BufferPool>> =
    LazyLock::new(|| Arc::new(BufferPool::new(1024, SMALL_BUFFER_SIZE)));

/// The shared medium (8 KiB) pool.
#[must_use]
pub fn medium_pool() -> &'static Arc<BufferPool> {
    &MEDIUM_POOL
}

/// The shared small (2 KiB) pool.
#[must_use]
pub fn small_pool() -> &'static Arc<BufferPool> {
    &SMALL_POOL
}

/// A byte buffer drawn from a pool.
///
/// Holds a window `[start, end)` into its backing slice. Dropping the
/// buffer returns the slice to its originating pool; an explicit
/// [`release`](Buffer::release) is idempotent.
#[derive(Debug)]
pub struct Buffer {
    data: Option<Vec<u8>>,
    pool: Option<Arc<BufferPool>>,
    start: usize,
    end: usize,
}

impl Buffer {
    /// Allocate a medium buffer from the shared pool.
    #[must_use]
    pub fn new() -> Self {
        medium_pool().allocate()
    }

    /// Allocate a small buffer from the shared pool.
    #[must_use]
    pub fn small() -> Self {
        small_pool().allocate()
    }

    /// Build an unpooled buffer holding a copy of `data`. Intended for
    /// tests and one-off control frames.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut v = vec![0u8; HEADROOM + data.len()];
        v[HEADROOM..].copy_from_slice(data);
        Self {
            data: Some(v),
            pool: None,
            start: HEADROOM,
            end: HEADROOM + data.len(),
        }
    }

    /// Number of payload bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the buffer holds no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether no more bytes can be appended.
    #[must_use]
    pub fn is_full(&self) -> bool {
        match &self.data {
            Some(d) => self.end == d.len(),
            None => true,
        }
    }

    /// The payload bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            Some(d) => &d[self.start..self.end],
            None => &[],
        }
    }

    /// Mutable view of the payload bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);
        match &mut self.data {
            Some(d) => &mut d[start..end],
            None => &mut [],
        }
    }

    /// The writable tail after the payload. Fill it, then call
    /// [`advance`](Buffer::advance) with the number of bytes written.
    pub fn unfilled(&mut self) -> &mut [u8] {
        let end = self.end;
        match &mut self.data {
            Some(d) => &mut d[end..],
            None => &mut [],
        }
    }

    /// Extend the payload window by `n` bytes previously written into
    /// [`unfilled`](Buffer::unfilled).
    pub fn advance(&mut self, n: usize) {
        let cap = self.data.as_ref().map_or(self.end, Vec::len);
        self.end = (self.end + n).min(cap);
    }

    /// Append as many bytes of `src` as fit; returns the number copied.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let room = self.unfilled();
        let n = room.len().min(src.len());
        room[..n].copy_from_slice(&src[..n]);
        self.end += n;
        n
    }

    /// Prepend `src` before the payload. Uses the reserved headroom when
    /// available and shifts the payload otherwise.
    pub fn prepend(&mut self, src: &[u8]) {
        let n = src.len();
        if self.start >= n {
            self.start -= n;
            let start = self.start;
            if let Some(d) = &mut self.data {
                d[start..start + n].copy_from_slice(src);
            }
            return;
        }
        // Headroom exhausted: rebuild the window at the front.
        let mut merged = Vec::with_capacity(n + self.len());
        merged.extend_from_slice(src);
        merged.extend_from_slice(self.bytes());
        if let Some(d) = &mut self.data {
            if d.len() < merged.len() {
                d.resize(merged.len(), 0);
            }
            d[..merged.len()].copy_from_slice(&merged);
            self.start = 0;
            self.end = merged.len();
        }
    }

    /// Drop the first `n` payload bytes.
    pub fn slice_from(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// Keep only the first `n` payload bytes.
    pub fn truncate(&mut self, n: usize) {
        if n < self.len() {
            self.end = self.start + n;
        }
    }

    /// Reset to an empty buffer, keeping the backing slice.
    pub fn clear(&mut self) {
        self.start = HEADROOM.min(self.data.as_ref().map_or(0, Vec::len));
        self.end = self.start;
    }

    /// Return the backing slice to its pool. Safe to call more than once;
    /// subsequent calls are no-ops.
    pub fn release(&mut self) {
        if let Some(data) = self.data.take() {
            if let Some(pool) = self.pool.take() {
                pool.recycle(data);
            }
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(4, 256))
    }

    #[test]
    fn test_allocate_and_recycle() {
        let pool = test_pool();
        let buf = pool.allocate();
        assert!(buf.is_empty());
        assert_eq!(pool.stats().allocations(), 1);

        drop(buf);
        assert_eq!(pool.stats().returns(), 1);

        let _buf = pool.allocate();
        assert_eq!(pool.stats().reuses(), 1);
        assert_eq!(pool.stats().allocations(), 1);
    }

    #[test]
    fn test_double_release_is_noop() {
        let pool = test_pool();
        let mut buf = pool.allocate();
        buf.release();
        buf.release();
        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.stats().outstanding(), 0);
    }

    #[test]
    fn test_append_and_slice() {
        let pool = test_pool();
        let mut buf = pool.allocate();
        assert_eq!(buf.append(b"hello world"), 11);
        buf.slice_from(6);
        assert_eq!(buf.bytes(), b"world");
        buf.truncate(3);
        assert_eq!(buf.bytes(), b"wor");
    }

    #[test]
    fn test_prepend_within_headroom() {
        let pool = test_pool();
        let mut buf = pool.allocate();
        buf.append(b"payload");
        buf.prepend(b"hdr:");
        assert_eq!(buf.bytes(), b"hdr:payload");
    }

    #[test]
    fn test_prepend_past_headroom() {
        let pool = test_pool();
        let mut buf = pool.allocate();
        buf.append(b"x");
        let big = [0xAAu8; 64];
        buf.prepend(&big);
        assert_eq!(buf.len(), 65);
        assert_eq!(&buf.bytes()[..64], &big[..]);
        assert_eq!(buf.bytes()[64], b'x');
    }

    #[test]
    fn test_unfilled_advance() {
        let pool = test_pool();
        let mut buf = pool.allocate();
        let room = buf.unfilled();
        room[0] = 7;
        room[1] = 9;
        buf.advance(2);
        assert_eq!(buf.bytes(), &[7, 9]);
    }

    #[test]
    fn test_pool_full_drops() {
        let pool = Arc::new(BufferPool::new(1, 64));
        let a = pool.allocate();
        let b = pool.allocate();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.stats().drops(), 1);
    }

    #[test]
    fn test_outstanding_tracks_live_buffers() {
        let pool = test_pool();
        let a = pool.allocate();
        let b = pool.allocate();
        assert_eq!(pool.stats().outstanding(), 2);
        drop(a);
        assert_eq!(pool.stats().outstanding(), 1);
        drop(b);
        assert_eq!(pool.stats().outstanding(), 0);
    }
}
