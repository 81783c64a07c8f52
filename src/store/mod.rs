//! Shared state: key/value store, repositories and cache invalidation.
//!
//! Concurrency counters and session bindings live behind [`kv::KvStore`] so
//! multiple gateway instances can share admission through one backing store.
//! Account reads and the transient scheduling mutations go through
//! [`repo::AccountRepository`]. Mutations fan out as [`CacheEvent`]s that
//! invalidate scheduler snapshots.

pub mod kv;
pub mod repo;

use tokio::sync::broadcast;

use crate::accounts::{AccountId, GroupId, Platform};

/// Invalidation event published on every account mutation.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// An account changed; buckets covering any of its groups must
    /// re-materialize.
    AccountChanged {
        account_id: AccountId,
        platform: Platform,
        groups: Vec<GroupId>,
    },
    /// Operator rules changed; rule caches drop wholesale.
    RulesChanged,
}

/// One publisher, N subscribers. In-process broadcast here; a broker-backed
/// implementation only needs to forward the same payloads.
#[derive(Clone)]
pub struct CacheEvents {
    tx: broadcast::Sender<CacheEvent>,
}

impl CacheEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn publish(&self, event: CacheEvent) {
        // No subscribers is fine; snapshots then refresh on natural expiry.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }
}

impl Default for CacheEvents {
    fn default() -> Self {
        Self::new()
    }
}
