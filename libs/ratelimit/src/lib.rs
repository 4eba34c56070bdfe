//! Sliding-window admission control.
//!
//! A call is admitted when fewer than `limit` calls were admitted for the same key during
//! the trailing `window`. Check and record happen in one atomic step of the backing
//! [`WindowStore`]; when that store errors or stalls the limiter denies the call.

#[cfg(feature = "redis-store")]
mod redis_store;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{RelayError, SharedClock, system_clock};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

#[cfg(feature = "redis-store")]
pub use redis_store::RedisWindowStore;

const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of a single atomic check-and-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Oldest record still inside the window after this call, if any.
    pub oldest: Option<OffsetDateTime>,
}

#[async_trait]
pub trait WindowStore: Send + Sync {
    async fn admit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: OffsetDateTime,
    ) -> Result<Admission>;

    /// Forgets keys with no record newer than `max_window`. Stores whose keys expire on
    /// their own keep the default.
    async fn purge_idle(&self, _now: OffsetDateTime, _max_window: Duration) -> Result<usize> {
        Ok(0)
    }
}

pub type SharedWindowStore = Arc<dyn WindowStore>;

/// Per-process window store. Each key is guarded by its map shard for the whole
/// prune-count-insert step.
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: DashMap<String, VecDeque<OffsetDateTime>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn admit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: OffsetDateTime,
    ) -> Result<Admission> {
        let cutoff = now - window;
        let mut records = self.windows.entry(key.to_string()).or_default();
        while records.front().is_some_and(|at| *at <= cutoff) {
            records.pop_front();
        }
        let allowed = (records.len() as u64) < u64::from(limit);
        if allowed {
            records.push_back(now);
        }
        let oldest = records.front().copied();
        let empty = records.is_empty();
        drop(records);
        if empty {
            self.windows.remove_if(key, |_, records| records.is_empty());
        }
        Ok(Admission { allowed, oldest })
    }

    async fn purge_idle(&self, now: OffsetDateTime, max_window: Duration) -> Result<usize> {
        let cutoff = now - max_window;
        let before = self.windows.len();
        self.windows
            .retain(|_, records| records.back().is_some_and(|last| *last > cutoff));
        Ok(before.saturating_sub(self.windows.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub reset_at: OffsetDateTime,
}

/// Key builders for the limiter scopes used by the relay.
pub struct RateKey;

impl RateKey {
    pub fn account(account_id: &str) -> String {
        format!("account:{account_id}")
    }

    /// Chat events arriving for a tenant; separate from its API budget.
    pub fn inbound(account_id: &str) -> String {
        format!("inbound:{account_id}")
    }

    pub fn ip(scope: &str, ip: &str) -> String {
        format!("{scope}:{ip}")
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: SharedWindowStore,
    clock: SharedClock,
    backend_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: SharedWindowStore) -> Self {
        Self {
            store,
            clock: system_clock(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryWindowStore::new()))
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    #[instrument(name = "ratelimit.check", skip(self))]
    pub async fn check_limit(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        let now = self.clock.now();
        let admitted = tokio::time::timeout(
            self.backend_timeout,
            self.store.admit(key, limit, window, now),
        )
        .await;

        let admission = match admitted {
            Ok(Ok(admission)) => admission,
            Ok(Err(err)) => {
                warn!(error = %err, "rate limit backend failed, denying");
                metrics::counter!("relay_ratelimit_backend_errors_total").increment(1);
                return deny_until(now + window);
            }
            Err(_) => {
                warn!(timeout_ms = self.backend_timeout.as_millis() as u64, "rate limit backend timed out, denying");
                metrics::counter!("relay_ratelimit_backend_errors_total").increment(1);
                return deny_until(now + window);
            }
        };

        let floor = now + time::Duration::MILLISECOND;
        let reset_at = admission
            .oldest
            .map(|oldest| oldest + window)
            .unwrap_or(now + window)
            .max(floor);
        if !admission.allowed {
            debug!(%reset_at, "rate limited");
            metrics::counter!("relay_ratelimit_denied_total").increment(1);
        }
        RateDecision {
            allowed: admission.allowed,
            reset_at,
        }
    }

    /// Releases keys that saw no admission during the trailing `max_window`. Pass the
    /// longest window any caller uses so no live window loses records.
    pub async fn purge_idle(&self, max_window: Duration) -> Result<usize> {
        let purged = self.store.purge_idle(self.clock.now(), max_window).await?;
        if purged > 0 {
            debug!(purged, "purged idle rate limit keys");
        }
        Ok(purged)
    }

    /// Like [`check_limit`](Self::check_limit) but maps a denial to [`RelayError::RateLimited`].
    pub async fn enforce(&self, key: &str, limit: u32, window: Duration) -> Result<(), RelayError> {
        let decision = self.check_limit(key, limit, window).await;
        if decision.allowed {
            Ok(())
        } else {
            Err(RelayError::RateLimited {
                reset_at: decision.reset_at,
            })
        }
    }
}

fn deny_until(reset_at: OffsetDateTime) -> RateDecision {
    RateDecision {
        allowed: false,
        reset_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{Clock, ManualClock};
    use time::macros::datetime;

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        let limiter = RateLimiter::memory().with_clock(clock.clone());
        (limiter, clock)
    }

    struct BrokenStore;

    #[async_trait]
    impl WindowStore for BrokenStore {
        async fn admit(&self, _: &str, _: u32, _: Duration, _: OffsetDateTime) -> Result<Admission> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl WindowStore for StalledStore {
        async fn admit(&self, _: &str, _: u32, _: Duration, _: OffsetDateTime) -> Result<Admission> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Admission {
                allowed: true,
                oldest: None,
            })
        }
    }

    #[tokio::test]
    async fn fourth_call_in_window_is_denied() {
        let (limiter, clock) = limiter();
        let window = Duration::from_secs(60);
        for _ in 0..3 {
            assert!(limiter.check_limit("k", 3, window).await.allowed);
        }
        let denied = limiter.check_limit("k", 3, window).await;
        assert!(!denied.allowed);
        assert!(denied.reset_at > clock.now());
        assert_eq!(denied.reset_at, clock.now() + window);
    }

    #[tokio::test]
    async fn window_slides_record_by_record() {
        let (limiter, clock) = limiter();
        let window = Duration::from_secs(2);
        assert!(limiter.check_limit("k", 2, window).await.allowed);
        clock.advance(Duration::from_secs(1));
        assert!(limiter.check_limit("k", 2, window).await.allowed);
        assert!(!limiter.check_limit("k", 2, window).await.allowed);

        clock.advance(Duration::from_millis(1100));
        let decision = limiter.check_limit("k", 2, window).await;
        assert!(decision.allowed);
        assert!(!limiter.check_limit("k", 2, window).await.allowed);
    }

    #[tokio::test]
    async fn full_window_elapsed_restores_capacity() {
        let (limiter, clock) = limiter();
        let window = Duration::from_secs(2);
        for _ in 0..3 {
            limiter.check_limit("k", 3, window).await;
        }
        assert!(!limiter.check_limit("k", 3, window).await.allowed);
        clock.advance(Duration::from_millis(2100));
        for _ in 0..3 {
            assert!(limiter.check_limit("k", 3, window).await.allowed);
        }
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (limiter, _) = limiter();
        let window = Duration::from_secs(60);
        assert!(limiter.check_limit("a", 1, window).await.allowed);
        assert!(!limiter.check_limit("a", 1, window).await.allowed);
        assert!(limiter.check_limit("b", 1, window).await.allowed);
    }

    #[tokio::test]
    async fn zero_limit_denies_everything() {
        let (limiter, clock) = limiter();
        let decision = limiter.check_limit("k", 0, Duration::from_secs(5)).await;
        assert!(!decision.allowed);
        assert!(decision.reset_at > clock.now());
    }

    #[tokio::test]
    async fn backend_error_fails_closed() {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        let limiter = RateLimiter::new(Arc::new(BrokenStore)).with_clock(clock.clone());
        let decision = limiter.check_limit("k", 100, Duration::from_secs(60)).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reset_at, clock.now() + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_fails_closed() {
        let limiter = RateLimiter::new(Arc::new(StalledStore))
            .with_backend_timeout(Duration::from_millis(50));
        let decision = limiter.check_limit("k", 100, Duration::from_secs(60)).await;
        assert!(!decision.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_limit() {
        let limiter = RateLimiter::memory();
        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .check_limit("shared", 10, Duration::from_secs(60))
                    .await
                    .allowed
            }));
        }
        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn enforce_maps_denial_to_error() {
        let (limiter, _) = limiter();
        let window = Duration::from_secs(60);
        limiter.enforce("k", 1, window).await.unwrap();
        let err = limiter.enforce("k", 1, window).await.unwrap_err();
        assert!(matches!(err, RelayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn purge_drops_idle_keys() {
        let store = MemoryWindowStore::new();
        let now = datetime!(2024-05-01 10:00 UTC);
        store.admit("k", 5, Duration::from_secs(1), now).await.unwrap();
        let purged = store
            .purge_idle(now + Duration::from_secs(2), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.windows.is_empty());
    }

    #[tokio::test]
    async fn one_shot_keys_do_not_accumulate() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        let limiter = RateLimiter::new(store.clone()).with_clock(clock.clone());
        let window = Duration::from_secs(60);
        for n in 0..1_000 {
            let ip = format!("203.0.113.{}", n % 250);
            limiter
                .check_limit(&RateKey::ip(&format!("pair-{n}"), &ip), 10, window)
                .await;
        }
        assert_eq!(store.key_count(), 1_000);

        clock.advance(Duration::from_secs(30));
        limiter.check_limit("recent", 10, window).await;
        assert_eq!(limiter.purge_idle(window).await.unwrap(), 0);

        clock.advance(Duration::from_secs(31));
        assert_eq!(limiter.purge_idle(window).await.unwrap(), 1_000);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn zero_limit_denials_leave_no_key_behind() {
        let store = MemoryWindowStore::new();
        let now = datetime!(2024-05-01 10:00 UTC);
        let admission = store.admit("k", 0, Duration::from_secs(1), now).await.unwrap();
        assert!(!admission.allowed);
        assert_eq!(store.key_count(), 0);
    }
}
