//! Per-destination connection reuse pool
//!
//! Dialers that advertise a reusable transport return the underlying
//! socket here instead of closing it; the next dial to the same
//! destination picks it up. Buckets are small and entries carry a TTL; a
//! background sweep evicts whatever expired between dials.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Idle connections a single destination may bank.
const BUCKET_CAPACITY: usize = 4;

struct PoolEntry<T> {
    value: T,
    expires_at: Instant,
}

/// A keyed pool of idle transport endpoints with per-entry TTL.
pub struct ConnectionPool<K, T> {
    buckets: Arc<DashMap<K, Vec<PoolEntry<T>>>>,
    ttl: Duration,
    sweeper: JoinHandle<()>,
}

impl<K, T> ConnectionPool<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Create a pool whose entries live for `ttl` once banked.
    #[must_use]
    pub fn new(ttl: Duration) -> Arc<Self> {
        let buckets: Arc<DashMap<K, Vec<PoolEntry<T>>>> = Arc::new(DashMap::new());
        let sweep_buckets = Arc::clone(&buckets);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl.max(Duration::from_secs(1)) / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                sweep_buckets.retain(|_, bucket| {
                    bucket.retain(|entry| entry.expires_at > now);
                    !bucket.is_empty()
                });
            }
        });
        Arc::new(Self {
            buckets,
            ttl,
            sweeper,
        })
    }

    /// Take an idle endpoint for `key`, skipping expired entries.
    pub fn take(&self, key: &K) -> Option<T> {
        let mut bucket = self.buckets.get_mut(key)?;
        let now = Instant::now();
        while let Some(entry) = bucket.pop() {
            if entry.expires_at > now {
                return Some(entry.value);
            }
        }
        None
    }

    /// Bank an idle endpoint under `key`. Dropped when the bucket is full.
    pub fn put(&self, key: K, value: T) {
        let mut bucket = self.buckets.entry(key).or_default();
        if bucket.len() >= BUCKET_CAPACITY {
            debug!("reuse pool bucket full, dropping connection");
            return;
        }
        bucket.push(PoolEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        });
    }

    /// Total banked entries, expired included until the next sweep.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> Drop for ConnectionPool<K, T> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_take_returns_banked_entry() {
        let pool: Arc<ConnectionPool<&str, u32>> = ConnectionPool::new(Duration::from_secs(60));
        assert!(pool.take(&"a").is_none());
        pool.put("a", 1);
        assert_eq!(pool.take(&"a"), Some(1));
        assert!(pool.take(&"a").is_none());
    }

    #[tokio::test]
    async fn test_bucket_capacity() {
        let pool: Arc<ConnectionPool<&str, u32>> = ConnectionPool::new(Duration::from_secs(60));
        for i in 0..10 {
            pool.put("a", i);
        }
        assert_eq!(pool.len(), BUCKET_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_not_returned() {
        let pool: Arc<ConnectionPool<&str, u32>> = ConnectionPool::new(Duration::from_secs(2));
        pool.put("a", 1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(pool.take(&"a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts() {
        let pool: Arc<ConnectionPool<&str, u32>> = ConnectionPool::new(Duration::from_secs(2));
        pool.put("a", 1);
        pool.put("b", 2);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(pool.is_empty());
    }
}
