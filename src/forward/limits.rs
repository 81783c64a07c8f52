//! Concurrency admission.
//!
//! Two counters per request: the user's slot and the chosen account's slot,
//! both living in the shared key/value store so every gateway instance sees
//! the same admission state. A wait-queue counter in front of the user slot
//! bounds how many requests may pile up waiting. Slots release exactly once
//! per acquisition via guard drop, on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::accounts::{AccountId, UserId};
use crate::config::SchedulerConfig;
use crate::forward::error::{GatewayError, GatewayResult, SlotActor};
use crate::store::kv::KvStore;

/// Heartbeat frame emitted to streaming clients stuck in the wait queue.
pub const PING_FRAME: &str = "data: {\"type\":\"ping\"}\n\n";

/// Releases its counter exactly once: explicitly via [`SlotGuard::release`]
/// or implicitly on drop.
pub struct SlotGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    /// No-op guards are handed out for uncapped actors.
    counted: bool,
    released: AtomicBool,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("key", &self.key)
            .field("counted", &self.counted)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotGuard {
    fn counted(kv: Arc<dyn KvStore>, key: String) -> Self {
        Self {
            kv,
            key,
            counted: true,
            released: AtomicBool::new(false),
        }
    }

    fn uncounted(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            key: String::new(),
            counted: false,
            released: AtomicBool::new(false),
        }
    }

    pub async fn release(&self) {
        if !self.counted || self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.kv.decr(&self.key).await {
            tracing::warn!(key = %self.key, error = %e, "slot release failed");
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.counted || self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let kv = Arc::clone(&self.kv);
        let key = std::mem::take(&mut self.key);
        tokio::spawn(async move {
            if let Err(e) = kv.decr(&key).await {
                tracing::warn!(key = %key, error = %e, "slot release failed");
            }
        });
    }
}

#[derive(Clone)]
pub struct ConcurrencyController {
    kv: Arc<dyn KvStore>,
    cfg: SchedulerConfig,
}

impl ConcurrencyController {
    pub fn new(kv: Arc<dyn KvStore>, cfg: SchedulerConfig) -> Self {
        Self { kv, cfg }
    }

    fn counter_ttl(&self) -> Duration {
        // Counters outlive the longest possible request, no more; a crashed
        // instance cannot hold slots past that.
        Duration::from_secs(self.cfg.upstream_deadline_secs + self.cfg.wait_deadline_secs)
    }

    /// Join the wait queue for a user. The ceiling is `max(1, cap * 2)`;
    /// uncapped users never contend for a slot, so they skip wait
    /// accounting entirely.
    pub async fn join_wait_queue(&self, user_id: UserId, cap: u32) -> GatewayResult<SlotGuard> {
        if cap == 0 {
            return Ok(SlotGuard::uncounted(Arc::clone(&self.kv)));
        }
        let key = format!("user_wait:{}", user_id);
        let max_wait = (cap * 2).max(1);
        if self
            .kv
            .incr_capped(&key, max_wait, self.counter_ttl())
            .await?
        {
            Ok(SlotGuard::counted(Arc::clone(&self.kv), key))
        } else {
            Err(GatewayError::TooManyPending)
        }
    }

    pub async fn try_acquire_user_slot(
        &self,
        user_id: UserId,
        cap: u32,
    ) -> GatewayResult<Option<SlotGuard>> {
        self.try_acquire(&format!("user_slot:{}", user_id), cap).await
    }

    pub async fn try_acquire_account_slot(
        &self,
        account_id: AccountId,
        cap: u32,
    ) -> GatewayResult<Option<SlotGuard>> {
        self.try_acquire(&format!("account_slot:{}", account_id), cap)
            .await
    }

    async fn try_acquire(&self, key: &str, cap: u32) -> GatewayResult<Option<SlotGuard>> {
        if cap == 0 {
            return Ok(Some(SlotGuard::uncounted(Arc::clone(&self.kv))));
        }
        if self.kv.incr_capped(key, cap, self.counter_ttl()).await? {
            Ok(Some(SlotGuard::counted(
                Arc::clone(&self.kv),
                key.to_string(),
            )))
        } else {
            Ok(None)
        }
    }

    /// Acquire a user slot, polling until the wait deadline. Streaming
    /// requests pass a `heartbeat` sender; a ping frame goes out every
    /// heartbeat interval so intermediaries keep the connection open and
    /// the eventual timeout surfaces gracefully.
    pub async fn acquire_user_slot_waiting(
        &self,
        user_id: UserId,
        cap: u32,
        heartbeat: Option<&mpsc::Sender<Bytes>>,
    ) -> GatewayResult<SlotGuard> {
        self.acquire_waiting(
            &format!("user_slot:{}", user_id),
            cap,
            SlotActor::User,
            heartbeat,
        )
        .await
    }

    pub async fn acquire_account_slot_waiting(
        &self,
        account_id: AccountId,
        cap: u32,
        heartbeat: Option<&mpsc::Sender<Bytes>>,
    ) -> GatewayResult<SlotGuard> {
        self.acquire_waiting(
            &format!("account_slot:{}", account_id),
            cap,
            SlotActor::Account,
            heartbeat,
        )
        .await
    }

    async fn acquire_waiting(
        &self,
        key: &str,
        cap: u32,
        actor: SlotActor,
        heartbeat: Option<&mpsc::Sender<Bytes>>,
    ) -> GatewayResult<SlotGuard> {
        if let Some(guard) = self.try_acquire(key, cap).await? {
            return Ok(guard);
        }

        let deadline = Instant::now() + Duration::from_secs(self.cfg.wait_deadline_secs);
        let poll = Duration::from_millis(self.cfg.wait_poll_ms.max(1));
        let heartbeat_every = Duration::from_secs(self.cfg.wait_heartbeat_secs.max(1));
        let mut next_heartbeat = Instant::now() + heartbeat_every;

        loop {
            if Instant::now() >= deadline {
                tracing::info!(key, actor = actor.as_str(), "slot wait deadline expired");
                return Err(GatewayError::SlotTimeout(actor));
            }

            tokio::time::sleep(poll).await;

            if let Some(guard) = self.try_acquire(key, cap).await? {
                return Ok(guard);
            }

            if let Some(tx) = heartbeat {
                if Instant::now() >= next_heartbeat {
                    // A closed channel means the client went away; stop
                    // pinging but keep waiting so the caller can observe the
                    // disconnect itself.
                    let _ = tx.try_send(Bytes::from_static(PING_FRAME.as_bytes()));
                    next_heartbeat = Instant::now() + heartbeat_every;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::kv::MemoryKv;

    fn controller_with(
        kv: &Arc<MemoryKv>,
        deadline_secs: u64,
        heartbeat_secs: u64,
    ) -> ConcurrencyController {
        let cfg = SchedulerConfig {
            wait_deadline_secs: deadline_secs,
            wait_poll_ms: 10,
            wait_heartbeat_secs: heartbeat_secs,
            ..SchedulerConfig::default()
        };
        ConcurrencyController::new(Arc::clone(kv) as Arc<dyn KvStore>, cfg)
    }

    fn controller(kv: &Arc<MemoryKv>) -> ConcurrencyController {
        controller_with(kv, 1, 1)
    }

    #[tokio::test]
    async fn wait_queue_ceiling_rejects() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller(&kv);

        // cap 1 -> ceiling max(1, 2) = 2.
        let _g1 = ctl.join_wait_queue(7, 1).await.unwrap();
        let _g2 = ctl.join_wait_queue(7, 1).await.unwrap();
        let err = ctl.join_wait_queue(7, 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::TooManyPending));
    }

    #[tokio::test]
    async fn uncapped_user_skips_wait_accounting() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller(&kv);
        let _g1 = ctl.join_wait_queue(7, 0).await.unwrap();
        let _g2 = ctl.join_wait_queue(7, 0).await.unwrap();
        assert_eq!(kv.counter("user_wait:7").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slot_released_on_explicit_release() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller(&kv);

        let guard = ctl.try_acquire_user_slot(1, 1).await.unwrap().unwrap();
        assert!(ctl.try_acquire_user_slot(1, 1).await.unwrap().is_none());

        guard.release().await;
        assert!(ctl.try_acquire_user_slot(1, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller(&kv);

        let g1 = ctl.try_acquire_user_slot(1, 2).await.unwrap().unwrap();
        let _g2 = ctl.try_acquire_user_slot(1, 2).await.unwrap().unwrap();

        g1.release().await;
        g1.release().await;
        drop(g1);
        tokio::task::yield_now().await;

        // Only one of the two slots is free again.
        assert_eq!(kv.counter("user_slot:1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn drop_releases_slot() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller(&kv);

        {
            let _guard = ctl.try_acquire_account_slot(9, 1).await.unwrap().unwrap();
            assert_eq!(kv.counter("account_slot:9").await.unwrap(), 1);
        }
        // Drop releases through a spawned task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.counter("account_slot:9").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn uncapped_actor_gets_noop_guard() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller(&kv);
        let guard = ctl.try_acquire_user_slot(1, 0).await.unwrap().unwrap();
        guard.release().await;
        assert_eq!(kv.counter("user_slot:1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn waiting_acquire_times_out_with_429_mapping() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller(&kv);

        let _held = ctl.try_acquire_user_slot(1, 1).await.unwrap().unwrap();
        let err = ctl
            .acquire_user_slot_waiting(1, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SlotTimeout(SlotActor::User)));
        assert_eq!(err.status_code(), axum::http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn waiting_acquire_succeeds_after_release() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller(&kv);

        let held = ctl.try_acquire_user_slot(1, 1).await.unwrap().unwrap();
        let ctl2 = ctl.clone();
        let waiter = tokio::spawn(async move { ctl2.acquire_user_slot_waiting(1, 1, None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release().await;

        let guard = waiter.await.unwrap().unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn heartbeats_flow_while_waiting() {
        let kv = Arc::new(MemoryKv::new());
        let ctl = controller_with(&kv, 3, 1);

        let _held = ctl.try_acquire_user_slot(1, 1).await.unwrap().unwrap();
        let (tx, mut rx) = mpsc::channel::<Bytes>(8);

        let ctl2 = ctl.clone();
        let waiter =
            tokio::spawn(async move { ctl2.acquire_user_slot_waiting(1, 1, Some(&tx)).await });

        let ping = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("heartbeat within wait window")
            .expect("channel open");
        assert_eq!(ping, Bytes::from_static(PING_FRAME.as_bytes()));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GatewayError::SlotTimeout(_))));
    }
}
