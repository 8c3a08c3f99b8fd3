//! Time-bounded collections
//!
//! A min-heap ordered by expiry time, swept by a ticker task. The queue
//! hands expired values to whoever listens; the map evicts its own
//! entries. Used for conversation-id quarantine and token-style caches.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct TimedEntry<T> {
    expiry: Instant,
    value: T,
}

impl<T> PartialEq for TimedEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry
    }
}

impl<T> Eq for TimedEntry<T> {}

impl<T> PartialOrd for TimedEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TimedEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so the BinaryHeap pops the earliest expiry first
        other.expiry.cmp(&self.expiry)
    }
}

/// A queue of values that fall out after their expiry time.
///
/// Expired values are delivered on the channel returned by
/// [`take_removed`](TimedQueue::take_removed).
pub struct TimedQueue<T> {
    heap: Arc<parking_lot::Mutex<BinaryHeap<TimedEntry<T>>>>,
    removed: parking_lot::Mutex<Option<mpsc::Receiver<T>>>,
    sweeper: JoinHandle<()>,
}

impl<T: Send + 'static> TimedQueue<T> {
    /// Create a queue whose sweeper ticks every `sweep_interval`.
    #[must_use]
    pub fn new(sweep_interval: Duration) -> Self {
        let heap: Arc<parking_lot::Mutex<BinaryHeap<TimedEntry<T>>>> =
            Arc::new(parking_lot::Mutex::new(BinaryHeap::new()));
        let (tx, rx) = mpsc::channel(16);
        let sweep_heap = Arc::clone(&heap);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                loop {
                    let expired = {
                        let mut heap = sweep_heap.lock();
                        match heap.peek() {
                            Some(entry) if entry.expiry <= Instant::now() => {
                                heap.pop().map(|e| e.value)
                            }
                            _ => None,
                        }
                    };
                    match expired {
                        Some(value) => {
                            if tx.send(value).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        Self {
            heap,
            removed: parking_lot::Mutex::new(Some(rx)),
            sweeper,
        }
    }

    /// Queue `value` to be removed at `expiry`.
    pub fn add(&self, value: T, expiry: Instant) {
        self.heap.lock().push(TimedEntry { expiry, value });
    }

    /// Number of values still pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether no values are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Take the channel of removed values. Yields `Some` exactly once.
    pub fn take_removed(&self) -> Option<mpsc::Receiver<T>> {
        self.removed.lock().take()
    }
}

impl<T> Drop for TimedQueue<T> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// A keyed map whose entries evict themselves after a per-entry TTL.
pub struct TimedMap<K, V> {
    data: Arc<DashMap<K, V>>,
    expirations: Arc<parking_lot::Mutex<BinaryHeap<TimedEntry<K>>>>,
    sweeper: JoinHandle<()>,
}

impl<K, V> TimedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a map whose sweeper ticks every `sweep_interval`.
    #[must_use]
    pub fn new(sweep_interval: Duration) -> Self {
        let data: Arc<DashMap<K, V>> = Arc::new(DashMap::new());
        let expirations: Arc<parking_lot::Mutex<BinaryHeap<TimedEntry<K>>>> =
            Arc::new(parking_lot::Mutex::new(BinaryHeap::new()));
        let sweep_data = Arc::clone(&data);
        let sweep_exp = Arc::clone(&expirations);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                loop {
                    let key = {
                        let mut heap = sweep_exp.lock();
                        match heap.peek() {
                            Some(entry) if entry.expiry <= Instant::now() => {
                                heap.pop().map(|e| e.value)
                            }
                            _ => None,
                        }
                    };
                    match key {
                        Some(key) => {
                            sweep_data.remove(&key);
                        }
                        None => break,
                    }
                }
            }
        });
        Self {
            data,
            expirations,
            sweeper,
        }
    }

    /// Insert `value` under `key`, to be evicted after `ttl`.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.data.insert(key.clone(), value);
        self.expirations.lock().push(TimedEntry {
            expiry: Instant::now() + ttl,
            value: key,
        });
    }

    /// Whether `key` is currently present.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Remove `key` ahead of its TTL.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.data.remove(key).map(|(_, v)| v)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<K, V> TimedMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Fetch a copy of the value under `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.data.get(key).map(|v| v.clone())
    }
}

impl<K, V> Drop for TimedMap<K, V> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_queue_delivers_expired_in_order() {
        let queue = TimedQueue::new(Duration::from_millis(10));
        let mut removed = queue.take_removed().unwrap();
        let now = Instant::now();
        queue.add("late", now + Duration::from_millis(50));
        queue.add("early", now + Duration::from_millis(5));

        assert_eq!(removed.recv().await.unwrap(), "early");
        assert_eq!(removed.recv().await.unwrap(), "late");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_holds_unexpired() {
        let queue = TimedQueue::new(Duration::from_millis(10));
        let mut removed = queue.take_removed().unwrap();
        queue.add(1u32, Instant::now() + Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(removed.try_recv().is_err());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_map_evicts_after_ttl() {
        let map = TimedMap::new(Duration::from_millis(10));
        map.set("token", 42u32, Duration::from_millis(30));
        assert_eq!(map.get(&"token"), Some(42));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!map.contains(&"token"));
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_map_remove_is_immediate() {
        let map: TimedMap<&str, u32> = TimedMap::new(Duration::from_secs(1));
        map.set("k", 7, Duration::from_secs(60));
        assert_eq!(map.remove(&"k"), Some(7));
        assert!(!map.contains(&"k"));
    }
}
