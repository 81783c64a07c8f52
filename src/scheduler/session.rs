//! Sticky-session store.
//!
//! One TTL'd entry per `(group, fingerprint)`, holding the ordered digest
//! chains bound to an account. Longest-prefix lookup over that embedded
//! history lets a continuing conversation recover its binding when its
//! chain has grown; each `save` retires the predecessor chain, so a
//! conversation holds one chain entry at steady state.

use std::sync::Arc;
use std::time::Duration;

use crate::accounts::{AccountId, GroupId};
use crate::error::AppResult;
use crate::store::kv::KvStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub session_uuid: String,
    pub account_id: AccountId,
    /// The chain prefix that matched; empty when the binding was found by
    /// fingerprint alone.
    pub matched_chain: String,
}

/// One chain bound under a fingerprint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ChainEntry {
    chain: String,
    uuid: String,
    account_id: AccountId,
}

#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

fn binding_key(group_id: GroupId, fingerprint: &str) -> String {
    format!("session:{}:{}", group_id, fingerprint)
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    async fn load(&self, group_id: GroupId, fingerprint: &str) -> AppResult<Vec<ChainEntry>> {
        let Some(raw) = self.kv.get(&binding_key(group_id, fingerprint)).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    async fn store(
        &self,
        group_id: GroupId,
        fingerprint: &str,
        entries: &[ChainEntry],
    ) -> AppResult<()> {
        let raw = serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string());
        self.kv
            .set(&binding_key(group_id, fingerprint), &raw, Some(self.ttl))
            .await
    }

    /// Bind the current digest chain to an account, retiring the previous
    /// round's chain from the entry. The TTL refreshes on every write.
    pub async fn save(
        &self,
        group_id: GroupId,
        fingerprint: &str,
        chain: &str,
        session_uuid: &str,
        account_id: AccountId,
        old_chain: &str,
    ) -> AppResult<()> {
        let mut entries = self.load(group_id, fingerprint).await?;

        if !old_chain.is_empty() && old_chain != chain {
            entries.retain(|e| e.chain != old_chain);
        }

        let entry = ChainEntry {
            chain: chain.to_string(),
            uuid: session_uuid.to_string(),
            account_id,
        };
        match entries.iter_mut().find(|e| e.chain == chain) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }

        self.store(group_id, fingerprint, &entries).await
    }

    /// Longest-prefix lookup within the fingerprint's entry: exact chain
    /// first, then strip the trailing `-segment` until a bound chain
    /// matches. With no chain match at all, the most recent binding still
    /// counts as a fingerprint hit.
    pub async fn find(
        &self,
        group_id: GroupId,
        fingerprint: &str,
        chain: &str,
    ) -> AppResult<Option<SessionBinding>> {
        let entries = self.load(group_id, fingerprint).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let mut candidate = chain;
        while !candidate.is_empty() {
            if let Some(entry) = entries.iter().find(|e| e.chain == candidate) {
                return Ok(Some(SessionBinding {
                    session_uuid: entry.uuid.clone(),
                    account_id: entry.account_id,
                    matched_chain: entry.chain.clone(),
                }));
            }
            match candidate.rfind('-') {
                Some(pos) => candidate = &candidate[..pos],
                None => break,
            }
        }

        let Some(latest) = entries.last() else {
            return Ok(None);
        };
        Ok(Some(SessionBinding {
            session_uuid: latest.uuid.clone(),
            account_id: latest.account_id,
            matched_chain: String::new(),
        }))
    }

    pub async fn delete(&self, group_id: GroupId, fingerprint: &str) -> AppResult<()> {
        self.kv.delete(&binding_key(group_id, fingerprint)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemoryKv;

    struct Fixture {
        kv: Arc<MemoryKv>,
        store: SessionStore,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let store = SessionStore::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            Duration::from_secs(300),
        );
        Fixture { kv, store }
    }

    #[tokio::test]
    async fn save_and_find_exact_chain() {
        let f = fixture();
        f.store.save(1, "fp", "s:a-u:b", "sess-1", 42, "").await.unwrap();

        let binding = f.store.find(1, "fp", "s:a-u:b").await.unwrap().unwrap();
        assert_eq!(binding.account_id, 42);
        assert_eq!(binding.session_uuid, "sess-1");
        assert_eq!(binding.matched_chain, "s:a-u:b");
    }

    #[tokio::test]
    async fn find_longest_prefix_within_entry() {
        let f = fixture();
        f.store
            .save(1, "fp", "s:a-u:b-a:c", "sess-1", 42, "")
            .await
            .unwrap();

        // Next round carries two more turns; the bound chain is a prefix.
        let binding = f
            .store
            .find(1, "fp", "s:a-u:b-a:c-u:d-a:e")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binding.account_id, 42);
        assert_eq!(binding.matched_chain, "s:a-u:b-a:c");
    }

    #[tokio::test]
    async fn fingerprint_hit_without_chain_match_returns_latest() {
        let f = fixture();
        f.store.save(1, "fp", "s:a-u:b", "sess-1", 42, "").await.unwrap();

        let binding = f.store.find(1, "fp", "s:z-u:q").await.unwrap().unwrap();
        assert_eq!(binding.account_id, 42);
        assert_eq!(binding.matched_chain, "");
    }

    #[tokio::test]
    async fn save_retires_old_chain_in_place() {
        let f = fixture();
        f.store.save(1, "fp", "s:a-u:b", "sess-1", 42, "").await.unwrap();
        f.store
            .save(1, "fp", "s:a-u:b-a:c-u:d", "sess-1", 42, "s:a-u:b")
            .await
            .unwrap();

        // The retired prefix no longer matches exactly; only the advanced
        // chain does.
        let binding = f
            .store
            .find(1, "fp", "s:a-u:b-a:c-u:d")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binding.matched_chain, "s:a-u:b-a:c-u:d");

        let raw = f.kv.get("session:1:fp").await.unwrap().unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn conversation_holds_one_key_at_steady_state() {
        let f = fixture();
        let mut prev = String::new();
        for round in 1..=5 {
            let chain = (0..round)
                .map(|i| format!("u:{}", i))
                .collect::<Vec<_>>()
                .join("-");
            f.store
                .save(1, "fp", &chain, "sess-1", 42, &prev)
                .await
                .unwrap();
            prev = chain;
        }

        let raw = f.kv.get("session:1:fp").await.unwrap().unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn repeated_identical_save_is_idempotent() {
        let f = fixture();
        f.store.save(1, "fp", "u:a", "sess-1", 42, "").await.unwrap();
        f.store.save(1, "fp", "u:a", "sess-1", 42, "u:a").await.unwrap();

        let raw = f.kv.get("session:1:fp").await.unwrap().unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn groups_are_isolated() {
        let f = fixture();
        f.store.save(1, "fp", "u:b", "sess-1", 42, "").await.unwrap();
        assert!(f.store.find(2, "fp", "u:b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_binding() {
        let f = fixture();
        f.store.save(1, "fp", "u:a", "sess-1", 42, "").await.unwrap();
        f.store.delete(1, "fp").await.unwrap();
        assert!(f.store.find(1, "fp", "u:a").await.unwrap().is_none());
    }
}
