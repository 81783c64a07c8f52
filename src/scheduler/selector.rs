//! Account selection.
//!
//! Picks the upstream account for a request: sticky binding first, then the
//! bucket snapshot filtered against live account state, ranked by priority,
//! load (for load-aware groups) and least-recent use. Candidates that tie
//! on the full sort key are shuffled so equal accounts share traffic
//! instead of herding onto one.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use crate::accounts::{Account, AccountId, Group, Platform};
use crate::forward::error::{GatewayError, GatewayResult};
use crate::scheduler::session::SessionStore;
use crate::scheduler::snapshot::{BucketKey, SnapshotCache};
use crate::store::kv::KvStore;
use crate::store::repo::AccountRepository;

pub struct SelectRequest<'a> {
    pub group: &'a Group,
    /// Wire-family platform of the inbound request.
    pub platform: Platform,
    pub model: &'a str,
    pub fingerprint: &'a str,
    pub digest_chain: &'a str,
    /// Accounts already tried during this request.
    pub excluded: &'a HashSet<AccountId>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub account: Account,
    /// True when the pick came from (or established) a session binding.
    pub sticky: bool,
    pub session_uuid: String,
}

#[derive(Clone)]
pub struct AccountSelector {
    snapshots: Arc<SnapshotCache>,
    sessions: SessionStore,
    repo: Arc<dyn AccountRepository>,
    kv: Arc<dyn KvStore>,
}

struct Candidate {
    account: Account,
    load: f64,
}

impl Candidate {
    fn sort_key(&self, load_aware: bool) -> (i32, u64, Option<DateTime<Utc>>) {
        // Load is bucketed to per-mille so float noise cannot break the
        // equal-key runs the shuffle operates on.
        let load_bucket = if load_aware {
            (self.load * 1000.0).round() as u64
        } else {
            0
        };
        (self.account.priority, load_bucket, self.account.last_used_at)
    }
}

impl AccountSelector {
    pub fn new(
        snapshots: Arc<SnapshotCache>,
        sessions: SessionStore,
        repo: Arc<dyn AccountRepository>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            snapshots,
            sessions,
            repo,
            kv,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Full live eligibility check for one account under this request.
    async fn passes_live(&self, account: &Account, req: &SelectRequest<'_>) -> bool {
        let now = Utc::now();
        if req.excluded.contains(&account.id) {
            return false;
        }
        if !account.is_schedulable_at(now) {
            return false;
        }
        if !account.groups.contains(&req.group.id) {
            return false;
        }
        if !account.allows_model(req.model) {
            return false;
        }
        if account.model_rate_limited(req.model, now) {
            return false;
        }
        true
    }

    async fn load_rate(&self, account: &Account) -> f64 {
        if account.concurrency_cap == 0 {
            return 0.0;
        }
        let in_flight = self
            .kv
            .counter(&format!("account_slot:{}", account.id))
            .await
            .unwrap_or(0);
        in_flight as f64 / account.concurrency_cap as f64
    }

    /// Select an account for the request. Sticky bindings are honored when
    /// the bound account still passes live checks; otherwise the bucket
    /// snapshot is ranked and the best survivor wins.
    pub async fn select(&self, req: &SelectRequest<'_>) -> GatewayResult<Selection> {
        if !req.fingerprint.is_empty() {
            if let Some(selection) = self.try_sticky(req).await? {
                return Ok(selection);
            }
        }

        let bucket = BucketKey {
            group_id: req.group.id,
            platform: req.platform,
            mode: req.group.mode,
        };
        let snapshot = self.snapshots.list_schedulable(bucket).await?;
        if snapshot.accounts.is_empty() {
            return Err(GatewayError::NoAvailableAccounts);
        }

        let mut candidates = Vec::with_capacity(snapshot.accounts.len());
        for stale in &snapshot.accounts {
            // Snapshot entries are only as fresh as the last invalidation;
            // re-read each candidate before trusting it.
            let Some(live) = self.repo.get_by_id(stale.id).await? else {
                continue;
            };
            if !self.passes_live(&live, req).await {
                continue;
            }
            let load = self.load_rate(&live).await;
            candidates.push(Candidate { account: live, load });
        }

        if candidates.is_empty() {
            return Err(GatewayError::NoAvailableAccounts);
        }

        let load_aware = req.group.mode == crate::accounts::SchedulingMode::LoadAware;
        candidates.sort_by(|a, b| a.sort_key(load_aware).cmp(&b.sort_key(load_aware)));
        shuffle_equal_runs(&mut candidates, load_aware);

        let account = candidates.remove(0).account;

        let sticky = !req.fingerprint.is_empty();
        let session_uuid = uuid::Uuid::new_v4().simple().to_string();
        if sticky {
            self.sessions
                .save(
                    req.group.id,
                    req.fingerprint,
                    req.digest_chain,
                    &session_uuid,
                    account.id,
                    "",
                )
                .await?;
        }

        tracing::debug!(
            account_id = account.id,
            model = req.model,
            group_id = req.group.id,
            sticky,
            "selected account"
        );

        Ok(Selection {
            account,
            sticky,
            session_uuid,
        })
    }

    async fn try_sticky(&self, req: &SelectRequest<'_>) -> GatewayResult<Option<Selection>> {
        let Some(binding) = self
            .sessions
            .find(req.group.id, req.fingerprint, req.digest_chain)
            .await?
        else {
            return Ok(None);
        };

        let Some(account) = self.repo.get_by_id(binding.account_id).await? else {
            self.sessions.delete(req.group.id, req.fingerprint).await?;
            return Ok(None);
        };

        if !self.passes_live(&account, req).await {
            return Ok(None);
        }

        // Advance the binding to the current chain; the save retires the
        // matched predecessor entry in place.
        if !req.digest_chain.is_empty() && binding.matched_chain != req.digest_chain {
            self.sessions
                .save(
                    req.group.id,
                    req.fingerprint,
                    req.digest_chain,
                    &binding.session_uuid,
                    account.id,
                    &binding.matched_chain,
                )
                .await?;
        }

        Ok(Some(Selection {
            account,
            sticky: true,
            session_uuid: binding.session_uuid,
        }))
    }
}

/// Shuffle runs of candidates whose sort keys tie exactly; order across
/// distinct keys is preserved.
fn shuffle_equal_runs(candidates: &mut [Candidate], load_aware: bool) {
    let mut rng = rand::thread_rng();
    let mut start = 0;
    while start < candidates.len() {
        let key = candidates[start].sort_key(load_aware);
        let mut end = start + 1;
        while end < candidates.len() && candidates[end].sort_key(load_aware) == key {
            end += 1;
        }
        if end - start > 1 {
            candidates[start..end].shuffle(&mut rng);
        }
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{AccountStatus, AccountType, SchedulingMode};
    use crate::store::kv::MemoryKv;
    use crate::store::repo::MemoryRepo;
    use crate::store::CacheEvents;
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn account(id: AccountId, priority: i32) -> Account {
        Account {
            id,
            name: format!("acct-{}", id),
            platform: Platform::Anthropic,
            account_type: AccountType::Apikey,
            status: AccountStatus::Active,
            schedulable: true,
            concurrency_cap: 0,
            priority,
            credentials: json!({"api_key": "k"}),
            extra: json!({}),
            proxy_id: None,
            groups: vec![1],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            rate_limit_reset_at: None,
            overload_until: None,
            temp_unschedulable_until: None,
            last_used_at: None,
        }
    }

    fn group() -> Group {
        Group {
            id: 1,
            name: "default".to_string(),
            daily_limit_usd: None,
            weekly_limit_usd: None,
            monthly_limit_usd: None,
            is_exclusive: false,
            mode: SchedulingMode::Mixed,
            is_subscription_type: false,
            allow_negative_balance: false,
        }
    }

    struct Fixture {
        repo: Arc<MemoryRepo>,
        kv: Arc<MemoryKv>,
        selector: AccountSelector,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRepo::new(CacheEvents::new()));
        let kv = Arc::new(MemoryKv::new());
        let snapshots = SnapshotCache::new(Arc::clone(&repo) as Arc<dyn AccountRepository>);
        let sessions = SessionStore::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            StdDuration::from_secs(300),
        );
        let selector = AccountSelector::new(
            snapshots,
            sessions,
            Arc::clone(&repo) as Arc<dyn AccountRepository>,
            Arc::clone(&kv) as Arc<dyn KvStore>,
        );
        Fixture { repo, kv, selector }
    }

    fn request<'a>(
        group: &'a Group,
        fingerprint: &'a str,
        excluded: &'a HashSet<AccountId>,
    ) -> SelectRequest<'a> {
        SelectRequest {
            group,
            platform: Platform::Anthropic,
            model: "claude-sonnet-4-5",
            fingerprint,
            digest_chain: "",
            excluded,
        }
    }

    #[tokio::test]
    async fn lowest_priority_wins() {
        let f = fixture();
        f.repo.insert_account(account(1, 50));
        f.repo.insert_account(account(2, 10));

        let g = group();
        let excluded = HashSet::new();
        let pick = f.selector.select(&request(&g, "", &excluded)).await.unwrap();
        assert_eq!(pick.account.id, 2);
        assert!(!pick.sticky);
    }

    #[tokio::test]
    async fn empty_snapshot_is_no_available_accounts() {
        let f = fixture();
        let g = group();
        let excluded = HashSet::new();
        let err = f
            .selector
            .select(&request(&g, "", &excluded))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAccounts));
    }

    #[tokio::test]
    async fn all_excluded_is_no_available_accounts() {
        let f = fixture();
        f.repo.insert_account(account(1, 0));
        let g = group();
        let excluded: HashSet<AccountId> = [1].into_iter().collect();
        let err = f
            .selector
            .select(&request(&g, "", &excluded))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAccounts));
    }

    #[tokio::test]
    async fn stale_snapshot_candidates_are_rechecked_live() {
        let f = fixture();
        f.repo.insert_account(account(1, 0));
        let g = group();
        let excluded = HashSet::new();

        // Warm the snapshot, then rate-limit the only account directly.
        f.selector.select(&request(&g, "", &excluded)).await.unwrap();
        f.repo
            .set_rate_limited(1, Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        // The cached snapshot may still hold the account; the live re-check
        // must reject it without forcing a refresh.
        let err = f
            .selector
            .select(&request(&g, "", &excluded))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableAccounts));
    }

    #[tokio::test]
    async fn sticky_binding_returns_same_account() {
        let f = fixture();
        f.repo.insert_account(account(1, 10));
        f.repo.insert_account(account(2, 10));
        let g = group();
        let excluded = HashSet::new();

        let first = f
            .selector
            .select(&request(&g, "fp-sticky", &excluded))
            .await
            .unwrap();
        for _ in 0..5 {
            let again = f
                .selector
                .select(&request(&g, "fp-sticky", &excluded))
                .await
                .unwrap();
            assert_eq!(again.account.id, first.account.id);
            assert_eq!(again.session_uuid, first.session_uuid);
            assert!(again.sticky);
        }
    }

    #[tokio::test]
    async fn sticky_binding_skipped_when_excluded() {
        let f = fixture();
        f.repo.insert_account(account(1, 10));
        f.repo.insert_account(account(2, 20));
        let g = group();
        let none = HashSet::new();

        let first = f.selector.select(&request(&g, "fp", &none)).await.unwrap();
        let excluded: HashSet<AccountId> = [first.account.id].into_iter().collect();
        let second = f.selector.select(&request(&g, "fp", &excluded)).await.unwrap();
        assert_ne!(second.account.id, first.account.id);
    }

    #[tokio::test]
    async fn model_rate_limited_accounts_are_skipped() {
        let f = fixture();
        let mut limited = account(1, 0);
        limited.extra = json!({"model_rate_limits": {
            "claude-sonnet-4-5": {"reset_at": (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339()}
        }});
        f.repo.insert_account(limited);
        f.repo.insert_account(account(2, 99));

        let g = group();
        let excluded = HashSet::new();
        let pick = f.selector.select(&request(&g, "", &excluded)).await.unwrap();
        assert_eq!(pick.account.id, 2);
    }

    #[tokio::test]
    async fn load_aware_prefers_idle_account() {
        let f = fixture();
        let mut busy = account(1, 0);
        busy.concurrency_cap = 2;
        let mut idle = account(2, 0);
        idle.concurrency_cap = 2;
        f.repo.insert_account(busy);
        f.repo.insert_account(idle);

        // Account 1 has one slot in flight.
        f.kv.incr_capped("account_slot:1", 2, StdDuration::from_secs(60))
            .await
            .unwrap();

        let mut g = group();
        g.mode = SchedulingMode::LoadAware;
        let excluded = HashSet::new();
        let pick = f.selector.select(&request(&g, "", &excluded)).await.unwrap();
        assert_eq!(pick.account.id, 2);
    }

    #[tokio::test]
    async fn equal_key_shuffle_spreads_picks() {
        let f = fixture();
        for id in 1..=4 {
            f.repo.insert_account(account(id, 7));
        }
        let g = group();
        let excluded = HashSet::new();

        let mut seen = HashSet::new();
        for _ in 0..64 {
            let pick = f.selector.select(&request(&g, "", &excluded)).await.unwrap();
            seen.insert(pick.account.id);
        }
        // Four equal-priority accounts under a random tiebreak; seeing only
        // one in 64 draws would mean the shuffle is not happening.
        assert!(seen.len() > 1);
    }
}
