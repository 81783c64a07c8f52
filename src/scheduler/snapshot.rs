//! Scheduler snapshots.
//!
//! Read-mostly, per-bucket views of the schedulable account pool. A bucket
//! is `(group, platform, mode)`. Snapshots materialize lazily from the
//! repository and are dropped when an account mutation publishes a
//! [`CacheEvent`]; they are correct only to the extent they are current, so
//! the selector re-checks every candidate live before using it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::accounts::{Account, GroupId, Platform, SchedulingMode};
use crate::error::AppResult;
use crate::store::repo::AccountRepository;
use crate::store::{CacheEvent, CacheEvents};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub group_id: GroupId,
    pub platform: Platform,
    pub mode: SchedulingMode,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: u64,
    pub accounts: Vec<Account>,
}

pub struct SnapshotCache {
    repo: Arc<dyn AccountRepository>,
    buckets: DashMap<BucketKey, Arc<Snapshot>>,
    version: AtomicU64,
}

/// Whether an account belongs in a bucket's pool at all. The per-model
/// filter stays in the selector; here we only exclude accounts that could
/// never serve the bucket's platform family.
fn serves_platform(account: &Account, platform: Platform) -> bool {
    if account.platform == platform {
        return true;
    }
    match platform {
        // Anthropic-wire buckets also pool Antigravity accounts and any
        // account whose mapping can claim claude models.
        Platform::Anthropic => {
            account.platform == Platform::Antigravity || account.extra().model_mapping().is_some()
        }
        Platform::Gemini => account.extra().model_mapping().is_some(),
        _ => false,
    }
}

impl SnapshotCache {
    pub fn new(repo: Arc<dyn AccountRepository>) -> Arc<Self> {
        Arc::new(Self {
            repo,
            buckets: DashMap::new(),
            version: AtomicU64::new(0),
        })
    }

    /// Subscribe to invalidation events. Runs until the event channel
    /// closes; spawn once at startup.
    pub fn spawn_invalidation_listener(self: &Arc<Self>, events: &CacheEvents) {
        let cache = Arc::clone(self);
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(CacheEvent::AccountChanged { groups, .. }) => {
                        cache.invalidate_groups(&groups);
                    }
                    Ok(CacheEvent::RulesChanged) => {}
                    // Lagged: we missed events, so every cached bucket is
                    // suspect.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        cache.invalidate_all();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn invalidate_groups(&self, groups: &[GroupId]) {
        self.buckets
            .retain(|key, _| !groups.contains(&key.group_id));
    }

    pub fn invalidate_all(&self) {
        self.buckets.clear();
    }

    /// Current snapshot for a bucket, materializing from the repository on
    /// a miss.
    pub async fn list_schedulable(&self, bucket: BucketKey) -> AppResult<Arc<Snapshot>> {
        if let Some(snapshot) = self.buckets.get(&bucket) {
            return Ok(Arc::clone(&snapshot));
        }
        self.materialize(bucket).await
    }

    async fn materialize(&self, bucket: BucketKey) -> AppResult<Arc<Snapshot>> {
        let now = Utc::now();
        let accounts: Vec<Account> = self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|a| a.groups.contains(&bucket.group_id))
            .filter(|a| serves_platform(a, bucket.platform))
            .filter(|a| a.is_schedulable_at(now))
            .collect();

        let snapshot = Arc::new(Snapshot {
            version: self.version.fetch_add(1, Ordering::Relaxed) + 1,
            accounts,
        });
        self.buckets.insert(bucket, Arc::clone(&snapshot));
        tracing::debug!(
            group_id = bucket.group_id,
            platform = %bucket.platform,
            version = snapshot.version,
            count = snapshot.accounts.len(),
            "materialized scheduler snapshot"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountStatus, AccountType};
    use crate::store::repo::MemoryRepo;
    use serde_json::json;

    fn account(id: i64, platform: Platform, groups: Vec<GroupId>) -> Account {
        Account {
            id,
            name: format!("acct-{}", id),
            platform,
            account_type: AccountType::Apikey,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency_cap: 0,
            priority: 0,
            credentials: json!({"api_key": "k"}),
            extra: json!({}),
            proxy_id: None,
            groups,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            last_used_at: None,
        }
    }

    fn bucket(group_id: GroupId) -> BucketKey {
        BucketKey {
            group_id,
            platform: Platform::Anthropic,
            mode: SchedulingMode::Mixed,
        }
    }

    #[tokio::test]
    async fn materializes_group_members_only() {
        let events = CacheEvents::new();
        let repo = Arc::new(MemoryRepo::new(events));
        repo.insert_account(account(1, Platform::Anthropic, vec![1]));
        repo.insert_account(account(2, Platform::Anthropic, vec![2]));

        let cache = SnapshotCache::new(repo);
        let snap = cache.list_schedulable(bucket(1)).await.unwrap();
        assert_eq!(snap.accounts.len(), 1);
        assert_eq!(snap.accounts[0].id, 1);
    }

    #[tokio::test]
    async fn gemini_account_without_mapping_stays_out_of_anthropic_bucket() {
        let events = CacheEvents::new();
        let repo = Arc::new(MemoryRepo::new(events));
        repo.insert_account(account(1, Platform::Gemini, vec![1]));
        let mut mapped = account(2, Platform::Gemini, vec![1]);
        mapped.extra = json!({"model_mapping": {"claude-sonnet-4-5": "gemini-2.5-pro"}});
        repo.insert_account(mapped);

        let cache = SnapshotCache::new(repo);
        let snap = cache.list_schedulable(bucket(1)).await.unwrap();
        assert_eq!(snap.accounts.len(), 1);
        assert_eq!(snap.accounts[0].id, 2);
    }

    #[tokio::test]
    async fn snapshot_is_cached_until_invalidated() {
        let events = CacheEvents::new();
        let repo = Arc::new(MemoryRepo::new(events));
        repo.insert_account(account(1, Platform::Anthropic, vec![1]));

        let cache = SnapshotCache::new(Arc::clone(&repo) as Arc<dyn AccountRepository>);
        let v1 = cache.list_schedulable(bucket(1)).await.unwrap().version;
        let v2 = cache.list_schedulable(bucket(1)).await.unwrap().version;
        assert_eq!(v1, v2);

        // New account lands; without invalidation the stale snapshot stays.
        repo.insert_account(account(9, Platform::Anthropic, vec![1]));
        let stale = cache.list_schedulable(bucket(1)).await.unwrap();
        assert_eq!(stale.accounts.len(), 1);

        cache.invalidate_groups(&[1]);
        let fresh = cache.list_schedulable(bucket(1)).await.unwrap();
        assert_eq!(fresh.accounts.len(), 2);
        assert!(fresh.version > v1);
    }

    #[tokio::test]
    async fn unschedulable_accounts_are_filtered_at_materialization() {
        let events = CacheEvents::new();
        let repo = Arc::new(MemoryRepo::new(events));
        let mut parked = account(1, Platform::Anthropic, vec![1]);
        parked.schedulable = false;
        repo.insert_account(parked);

        let cache = SnapshotCache::new(repo);
        let snap = cache.list_schedulable(bucket(1)).await.unwrap();
        assert!(snap.accounts.is_empty());
    }
}
