//! Key/value store abstraction.
//!
//! The gateway treats its shared store as opaque: TTL'd strings, capped
//! counters, and nothing else. [`MemoryKv`] is the in-process
//! implementation; a networked store only has to honor the same contract,
//! in particular the atomicity of [`KvStore::incr_capped`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::AppResult;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Set with optional TTL; `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()>;

    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Atomically increment a counter unless it already holds `cap` or more.
    /// `cap == 0` means unbounded. Returns whether the increment happened.
    /// The TTL is refreshed on every successful increment so counters from
    /// crashed instances drain on their own.
    async fn incr_capped(&self, key: &str, cap: u32, ttl: Duration) -> AppResult<bool>;

    /// Decrement a counter, saturating at zero.
    async fn decr(&self, key: &str) -> AppResult<()>;

    /// Current counter value (0 when absent or expired).
    async fn counter(&self, key: &str) -> AppResult<u32>;
}

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

struct CounterEntry {
    count: u32,
    expires_at: Instant,
}

/// In-process store backed by sharded maps. Expiry is lazy: entries are
/// dropped when a read or write observes them past their deadline.
pub struct MemoryKv {
    values: DashMap<String, ValueEntry>,
    counters: DashMap<String, CounterEntry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            counters: DashMap::new(),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        if let Some(entry) = self.values.get(key) {
            if matches!(entry.expires_at, Some(at) if at <= Instant::now()) {
                drop(entry);
                self.values.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.values.remove(key);
        self.counters.remove(key);
        Ok(())
    }

    async fn incr_capped(&self, key: &str, cap: u32, ttl: Duration) -> AppResult<bool> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                count: 0,
                expires_at: now + ttl,
            });
        if entry.expires_at <= now {
            entry.count = 0;
        }
        if cap > 0 && entry.count >= cap {
            return Ok(false);
        }
        entry.count += 1;
        entry.expires_at = now + ttl;
        Ok(true)
    }

    async fn decr(&self, key: &str) -> AppResult<()> {
        if let Some(mut entry) = self.counters.get_mut(key) {
            if entry.count > 0 {
                entry.count -= 1;
            }
        }
        Ok(())
    }

    async fn counter(&self, key: &str) -> AppResult<u32> {
        match self.counters.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.count),
            _ => Ok(0),
        }
    }
}
