//! Shared gateway state.
//!
//! One dependency record threaded through the request pipeline instead of
//! ambient singletons. Built once at startup and cloned behind `Arc` into
//! the axum router.

use std::sync::Arc;
use std::time::Duration;

use crate::billing::BillingGate;
use crate::config::Settings;
use crate::db::UsageStore;
use crate::error::AppResult;
use crate::forward::limits::ConcurrencyController;
use crate::scheduler::{AccountSelector, SessionStore, SnapshotCache};
use crate::store::kv::{KvStore, MemoryKv};
use crate::store::repo::{AccountRepository, DirectoryRepository, MemoryRepo};
use crate::store::CacheEvents;

pub struct Gateway {
    pub settings: Arc<Settings>,
    pub kv: Arc<dyn KvStore>,
    pub accounts: Arc<dyn AccountRepository>,
    pub directory: Arc<dyn DirectoryRepository>,
    pub snapshots: Arc<SnapshotCache>,
    pub sessions: SessionStore,
    pub selector: AccountSelector,
    pub limiter: ConcurrencyController,
    pub billing: BillingGate,
    pub usage_log: Arc<UsageStore>,
    pub events: CacheEvents,
}

impl Gateway {
    /// Wire the in-process implementations together. The repository and KV
    /// store are trait objects; swapping in networked backends changes
    /// nothing downstream.
    pub fn new(
        settings: Settings,
        kv: Arc<dyn KvStore>,
        accounts: Arc<dyn AccountRepository>,
        directory: Arc<dyn DirectoryRepository>,
        usage_log: Arc<UsageStore>,
        events: CacheEvents,
    ) -> Arc<Self> {
        let settings = Arc::new(settings);
        let snapshots = SnapshotCache::new(Arc::clone(&accounts));
        let sessions = SessionStore::new(
            Arc::clone(&kv),
            Duration::from_secs(settings.scheduler.session_ttl_secs),
        );
        let selector = AccountSelector::new(
            Arc::clone(&snapshots),
            sessions.clone(),
            Arc::clone(&accounts),
            Arc::clone(&kv),
        );
        let limiter = ConcurrencyController::new(Arc::clone(&kv), settings.scheduler.clone());
        let billing = BillingGate::new(Arc::clone(&usage_log), Arc::clone(&settings));

        Arc::new(Self {
            settings,
            kv,
            accounts,
            directory,
            snapshots,
            sessions,
            selector,
            limiter,
            billing,
            usage_log,
            events,
        })
    }

    /// Fully in-memory gateway for tests and single-node runs.
    pub fn in_memory(settings: Settings) -> AppResult<(Arc<Self>, Arc<MemoryRepo>)> {
        let events = CacheEvents::new();
        let repo = Arc::new(MemoryRepo::new(events.clone()));
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let usage_log = Arc::new(UsageStore::open_in_memory()?);
        let gateway = Self::new(
            settings,
            kv,
            Arc::clone(&repo) as Arc<dyn AccountRepository>,
            Arc::clone(&repo) as Arc<dyn DirectoryRepository>,
            usage_log,
            events,
        );
        Ok((gateway, repo))
    }

    /// Subscribe the snapshot cache to account mutations. Call once after
    /// the runtime is up.
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.snapshots.spawn_invalidation_listener(&self.events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{
        Account, AccountStatus, AccountType, ApiKey, ApiKeyStatus, Group, Platform,
        SchedulingMode, User, UserStatus,
    };
    use crate::forward::middleware;
    use crate::scheduler::SelectRequest;
    use axum::http::{HeaderMap, HeaderValue};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn wiring_resolves_caller_and_selects_account() {
        let (gw, repo) = Gateway::in_memory(Settings::default()).unwrap();

        repo.insert_group(Group {
            id: 1,
            name: "default".to_string(),
            daily_limit_usd: None,
            weekly_limit_usd: None,
            monthly_limit_usd: None,
            is_exclusive: false,
            mode: SchedulingMode::Mixed,
            is_subscription_type: false,
            allow_negative_balance: false,
        });
        repo.insert_user(User {
            id: 10,
            balance_usd: 5.0,
            concurrency_cap: 4,
            status: UserStatus::Active,
            allowed_groups: vec![1],
        });
        repo.insert_api_key(ApiKey {
            id: 100,
            user_id: 10,
            hashed_secret: middleware::hash_api_key("sk-live-test"),
            group_id: 1,
            status: ApiKeyStatus::Active,
        });
        repo.insert_account(Account {
            id: 7,
            name: "primary".to_string(),
            platform: Platform::Anthropic,
            account_type: AccountType::Apikey,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency_cap: 0,
            priority: 0,
            credentials: json!({"api_key": "upstream-key"}),
            extra: json!({}),
            proxy_id: None,
            groups: vec![1],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            last_used_at: None,
        });

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-live-test"));
        let caller = middleware::authenticate(&gw, &headers).await.unwrap();
        assert_eq!(caller.user.id, 10);
        assert_eq!(caller.group.id, 1);

        gw.billing
            .check_eligibility(&caller.user, &caller.group, caller.subscription.as_ref())
            .unwrap();

        let excluded = std::collections::HashSet::new();
        let selection = gw
            .selector
            .select(&SelectRequest {
                group: &caller.group,
                platform: Platform::Anthropic,
                model: "claude-sonnet-4-5",
                fingerprint: "",
                digest_chain: "",
                excluded: &excluded,
            })
            .await
            .unwrap();
        assert_eq!(selection.account.id, 7);
    }
}
