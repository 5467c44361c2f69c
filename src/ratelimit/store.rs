//! Storage backends for rate-limit records.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Store of timestamped hits per key.
///
/// Timestamps are unix nanoseconds. Implementations must be safe under
/// concurrent callers; the check-then-add sequence in the limiter is *not*
/// atomic across the store, so a bounded overshoot under concurrency is
/// expected and accepted.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Deletes timestamps in the closed interval `[from, to]`.
    async fn remove_old_records(&self, key: &str, from: i64, to: i64) -> Result<()>;

    /// Counts the records currently held under the key.
    async fn count_records(&self, key: &str) -> Result<u64>;

    /// Inserts a timestamp, preserving ascending order.
    async fn add_record(&self, key: &str, at: i64) -> Result<()>;

    /// Sets or refreshes the absolute expiry of the key.
    async fn expire_key(&self, key: &str, ttl: Duration) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    data: HashMap<String, Vec<i64>>,
    expires: HashMap<String, Instant>,
}

impl MemoryInner {
    /// Drops the key if its TTL has passed. Returns true when it was dropped.
    fn evict_if_expired(&mut self, key: &str) -> bool {
        match self.expires.get(key) {
            Some(deadline) if Instant::now() > *deadline => {
                self.data.remove(key);
                self.expires.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// In-memory store: an ordered timestamp sequence per key plus an expiry
/// map, everything behind a single exclusive lock.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateStore for InMemoryStore {
    async fn remove_old_records(&self, key: &str, from: i64, to: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.evict_if_expired(key) {
            return Ok(());
        }

        if let Some(records) = inner.data.get_mut(key) {
            let start = records.partition_point(|&t| t < from);
            let end = records.partition_point(|&t| t <= to);
            records.drain(start..end);
        }

        Ok(())
    }

    async fn count_records(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.evict_if_expired(key) {
            return Ok(0);
        }

        Ok(inner.data.get(key).map_or(0, |r| r.len() as u64))
    }

    async fn add_record(&self, key: &str, at: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.evict_if_expired(key);

        let records = inner.data.entry(key.to_string()).or_default();
        let idx = records.partition_point(|&t| t < at);
        records.insert(idx, at);

        Ok(())
    }

    async fn expire_key(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.expires.insert(key.to_string(), Instant::now() + ttl);

        Ok(())
    }
}
