//! Repository interfaces over the persistence layer.
//!
//! The gateway never owns account storage; it reads accounts and pushes the
//! transient scheduling fields back through [`AccountRepository`]. All
//! transient writes are monotonic: a write that would pull a deadline back
//! toward the past is dropped, which keeps last-write-wins safe without
//! read-modify-write locking.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;

use crate::accounts::{
    Account, AccountId, ApiKey, Group, GroupId, Subscription, User, UserId,
};
use crate::error::{AppError, AppResult};
use crate::store::{CacheEvent, CacheEvents};

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get_by_id(&self, id: AccountId) -> AppResult<Option<Account>>;

    async fn list(&self) -> AppResult<Vec<Account>>;

    async fn update(&self, account: Account) -> AppResult<()>;

    async fn set_rate_limited(&self, id: AccountId, reset_at: DateTime<Utc>) -> AppResult<()>;

    async fn set_overload(&self, id: AccountId, until: DateTime<Utc>) -> AppResult<()>;

    async fn set_temp_unschedulable(
        &self,
        id: AccountId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> AppResult<()>;

    async fn set_model_rate_limit(
        &self,
        id: AccountId,
        model: &str,
        reset_at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn update_last_used(&self, used: HashMap<AccountId, DateTime<Utc>>) -> AppResult<()>;
}

/// Lookups the request path needs before an account is ever chosen.
#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    /// Resolve an API key by the SHA-256 hex digest of its secret.
    async fn get_api_key_by_hash(&self, hashed_secret: &str) -> AppResult<Option<ApiKey>>;

    async fn get_user(&self, id: UserId) -> AppResult<Option<User>>;

    async fn get_group(&self, id: GroupId) -> AppResult<Option<Group>>;

    async fn get_subscription(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> AppResult<Option<Subscription>>;
}

/// In-memory repository. Production deployments put a database behind these
/// traits; tests and single-node setups run on this directly.
pub struct MemoryRepo {
    accounts: DashMap<AccountId, Account>,
    api_keys: DashMap<String, ApiKey>,
    users: DashMap<UserId, User>,
    groups: DashMap<GroupId, Group>,
    subscriptions: DashMap<(UserId, GroupId), Subscription>,
    events: CacheEvents,
}

impl MemoryRepo {
    pub fn new(events: CacheEvents) -> Self {
        Self {
            accounts: DashMap::new(),
            api_keys: DashMap::new(),
            users: DashMap::new(),
            groups: DashMap::new(),
            subscriptions: DashMap::new(),
            events,
        }
    }

    pub fn insert_account(&self, account: Account) {
        self.publish_changed(&account);
        self.accounts.insert(account.id, account);
    }

    pub fn insert_api_key(&self, key: ApiKey) {
        self.api_keys.insert(key.hashed_secret.clone(), key);
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn insert_group(&self, group: Group) {
        self.groups.insert(group.id, group);
    }

    pub fn insert_subscription(&self, sub: Subscription) {
        self.subscriptions.insert((sub.user_id, sub.group_id), sub);
    }

    fn publish_changed(&self, account: &Account) {
        self.events.publish(CacheEvent::AccountChanged {
            account_id: account.id,
            platform: account.platform,
            groups: account.groups.clone(),
        });
    }

    fn mutate<F>(&self, id: AccountId, f: F) -> AppResult<()>
    where
        F: FnOnce(&mut Account),
    {
        let mut entry = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("account {}", id)))?;
        f(&mut entry);
        entry.updated_at = Utc::now();
        let snapshot = entry.clone();
        drop(entry);
        self.publish_changed(&snapshot);
        Ok(())
    }
}

/// Keep `Some(t)` only moving forward in time.
fn monotonic_max(current: Option<DateTime<Utc>>, next: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match current {
        Some(t) if t >= next => Some(t),
        _ => Some(next),
    }
}

#[async_trait]
impl AccountRepository for MemoryRepo {
    async fn get_by_id(&self, id: AccountId) -> AppResult<Option<Account>> {
        Ok(self.accounts.get(&id).map(|a| a.clone()))
    }

    async fn list(&self) -> AppResult<Vec<Account>> {
        Ok(self.accounts.iter().map(|a| a.clone()).collect())
    }

    async fn update(&self, account: Account) -> AppResult<()> {
        self.publish_changed(&account);
        self.accounts.insert(account.id, account);
        Ok(())
    }

    async fn set_rate_limited(&self, id: AccountId, reset_at: DateTime<Utc>) -> AppResult<()> {
        self.mutate(id, |a| {
            a.rate_limit_reset_at = monotonic_max(a.rate_limit_reset_at, reset_at);
        })
    }

    async fn set_overload(&self, id: AccountId, until: DateTime<Utc>) -> AppResult<()> {
        self.mutate(id, |a| {
            a.overload_until = monotonic_max(a.overload_until, until);
        })
    }

    async fn set_temp_unschedulable(
        &self,
        id: AccountId,
        until: DateTime<Utc>,
        reason: &str,
    ) -> AppResult<()> {
        tracing::warn!(account_id = id, %until, reason, "account parked as temporarily unschedulable");
        self.mutate(id, |a| {
            a.temp_unschedulable_until = monotonic_max(a.temp_unschedulable_until, until);
        })
    }

    async fn set_model_rate_limit(
        &self,
        id: AccountId,
        model: &str,
        reset_at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.mutate(id, |a| {
            let current = a.extra().model_rate_limit_reset(model);
            if matches!(current, Some(t) if t >= reset_at) {
                return;
            }
            let extra = a.extra.as_object_mut();
            let Some(extra) = extra else {
                a.extra = json!({
                    "model_rate_limits": { model: { "reset_at": reset_at.to_rfc3339() } }
                });
                return;
            };
            let limits = extra
                .entry("model_rate_limits")
                .or_insert_with(|| json!({}));
            if let Some(limits) = limits.as_object_mut() {
                limits.insert(
                    model.to_string(),
                    json!({ "reset_at": reset_at.to_rfc3339() }),
                );
            }
        })
    }

    async fn update_last_used(&self, used: HashMap<AccountId, DateTime<Utc>>) -> AppResult<()> {
        for (id, at) in used {
            if let Some(mut entry) = self.accounts.get_mut(&id) {
                entry.last_used_at = monotonic_max(entry.last_used_at, at);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryRepository for MemoryRepo {
    async fn get_api_key_by_hash(&self, hashed_secret: &str) -> AppResult<Option<ApiKey>> {
        Ok(self.api_keys.get(hashed_secret).map(|k| k.clone()))
    }

    async fn get_user(&self, id: UserId) -> AppResult<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn get_group(&self, id: GroupId) -> AppResult<Option<Group>> {
        Ok(self.groups.get(&id).map(|g| g.clone()))
    }

    async fn get_subscription(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> AppResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .get(&(user_id, group_id))
            .map(|s| s.clone()))
    }
}
