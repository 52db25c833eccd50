//! Admission control for backends and credentials.
//!
//! Three limiter kinds are supported: a token bucket for QPS limits (via the
//! governor crate), a sliding window over the trailing minute for QPM/RPM
//! limits, and a semaphore for concurrency limits. Limiters are created lazily
//! per key and cached for the process lifetime in a [`LimiterRegistry`].

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use nonzero_ext::nonzero;
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::core::cancel::CancelHandle;
use crate::core::config::{Credentials, LimitConfig};

/// Admission timeout used when a limit does not configure one.
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Trailing interval for QPM/RPM limits.
pub const SLIDING_WINDOW_INTERVAL: Duration = Duration::from_secs(60);

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Longest token interval for a QPS limit; smaller rates are treated as this.
const MAX_QPS_PERIOD: Duration = Duration::from_secs(86_400 * 365);

/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

type DirectRateLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Kind of admission limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Qps,
    /// Also used for `rpm`
    Qpm,
    Concurrency,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Qps => "qps",
            LimitKind::Qpm => "qpm",
            LimitKind::Concurrency => "concurrency",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A usable limit: kind, positive value and admission timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitSpec {
    pub kind: LimitKind,
    pub value: f64,
    pub timeout: Duration,
}

impl LimitSpec {
    /// Pick the governing limit from a config block.
    ///
    /// Precedence is qps, qpm, rpm (as qpm), concurrency; the first positive
    /// value wins. Returns `None` when nothing usable is configured.
    pub fn from_config(config: &LimitConfig) -> Option<Self> {
        let (kind, value) = [
            (LimitKind::Qps, config.qps),
            (LimitKind::Qpm, config.qpm),
            (LimitKind::Qpm, config.rpm),
            (LimitKind::Concurrency, config.concurrency),
        ]
        .into_iter()
        .find(|(_, value)| value.is_finite() && *value > 0.0)?;

        let timeout = if config.timeout == 0 {
            DEFAULT_ADMISSION_TIMEOUT
        } else {
            Duration::from_secs(config.timeout).min(FAR_FUTURE)
        };

        Some(Self {
            kind,
            value,
            timeout,
        })
    }

    /// Read the nested `limit` object carried by a credential set.
    ///
    /// Numbers may be integers or floats; anything that is not an object
    /// yields `None`.
    pub fn from_credentials(credentials: &Credentials) -> Option<Self> {
        let limit = credentials.get("limit")?.as_object()?;
        let number = |key: &str| limit.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);

        let config = LimitConfig {
            qps: number("qps"),
            qpm: number("qpm"),
            rpm: number("rpm"),
            concurrency: number("concurrency"),
            timeout: number("timeout").max(0.0) as u64,
        };
        Self::from_config(&config)
    }
}

/// Why an admission wait gave up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("admission deadline exceeded")]
    DeadlineExceeded,

    #[error("admission wait canceled")]
    Canceled,
}

impl WaitError {
    /// Short label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            WaitError::DeadlineExceeded => "deadline",
            WaitError::Canceled => "canceled",
        }
    }
}

/// Deadline and cancellation signal bounding one admission wait.
#[derive(Clone)]
pub struct WaitContext {
    deadline: Instant,
    cancel: CancelHandle,
}

impl WaitContext {
    pub fn new(timeout: Duration, cancel: CancelHandle) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self { deadline, cancel }
    }

    pub fn with_deadline(deadline: Instant, cancel: CancelHandle) -> Self {
        Self { deadline, cancel }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Drive `fut` until it finishes, the deadline passes, or the handle is cancelled.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, WaitError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WaitError::Canceled),
            res = tokio::time::timeout_at(self.deadline, fut) => {
                res.map_err(|_| WaitError::DeadlineExceeded)
            }
        }
    }
}

/// Sliding-window limiter: at most `max_requests` admissions within the
/// trailing `interval`.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    interval: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, interval: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            interval,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests.min(1024))),
        }
    }

    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, SLIDING_WINDOW_INTERVAL)
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Admit now if the window has room, recording the admission.
    pub fn allow(&self) -> bool {
        self.try_admit().is_ok()
    }

    /// Admit, or return how long until the oldest admission leaves the window.
    fn try_admit(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(cutoff) = now.checked_sub(self.interval) {
            while timestamps.front().is_some_and(|t| *t <= cutoff) {
                timestamps.pop_front();
            }
        }

        if timestamps.len() < self.max_requests {
            timestamps.push_back(now);
            return Ok(());
        }

        let until_free = timestamps
            .front()
            .map(|oldest| (*oldest + self.interval).saturating_duration_since(now))
            .unwrap_or_default();
        Err(until_free)
    }

    /// Wait until admitted, polling with exponential backoff.
    ///
    /// Unbounded on its own; callers bound it with a [`WaitContext`].
    pub async fn wait(&self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let until_free = match self.try_admit() {
                Ok(()) => return,
                Err(until_free) => until_free,
            };

            tokio::time::sleep(backoff.min(until_free).max(MIN_BACKOFF)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

/// A concurrency slot held for the lifetime of the guard.
///
/// Dropping the guard releases the slot, so release happens exactly once on
/// every exit path. Guards from rate limiters hold nothing.
#[derive(Debug, Default)]
pub struct AdmissionGuard {
    permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionGuard {
    pub fn holds_slot(&self) -> bool {
        self.permit.is_some()
    }

    /// Release the slot now instead of at end of scope.
    pub fn release(self) {}
}

/// One admission limiter; the variant is fixed at creation by the limit kind.
pub enum Limiter {
    TokenBucket(DirectRateLimiter),
    SlidingWindow(SlidingWindowLimiter),
    Concurrency {
        semaphore: Arc<Semaphore>,
        capacity: usize,
    },
}

impl Limiter {
    pub fn new(spec: &LimitSpec) -> Self {
        match spec.kind {
            LimitKind::Qps => {
                // Burst equals one second's worth of tokens, at least one.
                let burst = NonZeroU32::new(spec.value as u32).unwrap_or(nonzero!(1u32));
                let period = Duration::try_from_secs_f64(1.0 / spec.value)
                    .map_or(MAX_QPS_PERIOD, |period| period.min(MAX_QPS_PERIOD));
                let quota = Quota::with_period(period)
                    .unwrap_or_else(|| Quota::per_second(burst))
                    .allow_burst(burst);
                Limiter::TokenBucket(GovernorRateLimiter::direct(quota))
            }
            LimitKind::Qpm => {
                Limiter::SlidingWindow(SlidingWindowLimiter::per_minute(spec.value as usize))
            }
            LimitKind::Concurrency => {
                let capacity = (spec.value as usize).clamp(1, Semaphore::MAX_PERMITS);
                Limiter::Concurrency {
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    capacity,
                }
            }
        }
    }

    pub fn kind(&self) -> LimitKind {
        match self {
            Limiter::TokenBucket(_) => LimitKind::Qps,
            Limiter::SlidingWindow(_) => LimitKind::Qpm,
            Limiter::Concurrency { .. } => LimitKind::Concurrency,
        }
    }

    /// Block until a rate token is available.
    ///
    /// A no-op for concurrency limiters, which only gate through
    /// [`Limiter::acquire_slot`].
    pub async fn wait(&self, ctx: &WaitContext) -> Result<(), WaitError> {
        match self {
            Limiter::TokenBucket(bucket) => ctx.run(bucket.until_ready()).await,
            Limiter::SlidingWindow(window) => ctx.run(window.wait()).await,
            Limiter::Concurrency { .. } => Ok(()),
        }
    }

    /// Take a concurrency slot, waiting for one to free up.
    ///
    /// Rate limiters return an empty guard immediately.
    pub async fn acquire_slot(&self, ctx: &WaitContext) -> Result<AdmissionGuard, WaitError> {
        match self {
            Limiter::Concurrency { semaphore, .. } => {
                let permit = ctx
                    .run(semaphore.clone().acquire_owned())
                    .await?
                    // The semaphore is never closed.
                    .map_err(|_| WaitError::Canceled)?;
                Ok(AdmissionGuard {
                    permit: Some(permit),
                })
            }
            _ => Ok(AdmissionGuard::default()),
        }
    }

    /// Full admission for this limiter's kind: wait for a token or take a slot.
    pub async fn admit(&self, ctx: &WaitContext) -> Result<AdmissionGuard, WaitError> {
        match self {
            Limiter::Concurrency { .. } => self.acquire_slot(ctx).await,
            _ => {
                self.wait(ctx).await?;
                Ok(AdmissionGuard::default())
            }
        }
    }

    /// Free concurrency slots; `None` for rate limiters.
    pub fn available_slots(&self) -> Option<usize> {
        match self {
            Limiter::Concurrency { semaphore, .. } => Some(semaphore.available_permits()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limiter::TokenBucket(_) => f.write_str("Limiter::TokenBucket"),
            Limiter::SlidingWindow(w) => f
                .debug_struct("Limiter::SlidingWindow")
                .field("max_requests", &w.max_requests)
                .finish(),
            Limiter::Concurrency { capacity, .. } => f
                .debug_struct("Limiter::Concurrency")
                .field("capacity", capacity)
                .finish(),
        }
    }
}

/// Process-wide cache of limiters by key. Entries are created once and never evicted.
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<Limiter>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
        }
    }

    /// Return the limiter for `key`, creating it from `spec` on first use.
    ///
    /// Later calls for the same key get the same instance even if `spec` differs.
    pub fn acquire(&self, key: &str, spec: &LimitSpec) -> Arc<Limiter> {
        if let Some(limiter) = self.limiters.get(key) {
            return limiter.clone();
        }

        self.limiters
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(
                    limiter_key = %key,
                    kind = %spec.kind,
                    value = spec.value,
                    "Creating admission limiter"
                );
                Arc::new(Limiter::new(spec))
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Limiter>> {
        self.limiters.get(key).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn spec(kind: LimitKind, value: f64) -> LimitSpec {
        LimitSpec {
            kind,
            value,
            timeout: DEFAULT_ADMISSION_TIMEOUT,
        }
    }

    fn ctx(timeout: Duration) -> WaitContext {
        WaitContext::new(timeout, CancelHandle::new())
    }

    #[test]
    fn test_limit_spec_precedence() {
        let config = LimitConfig {
            qps: 0.0,
            qpm: 0.0,
            rpm: 30.0,
            concurrency: 4.0,
            timeout: 0,
        };
        let spec = LimitSpec::from_config(&config).unwrap();
        assert_eq!(spec.kind, LimitKind::Qpm);
        assert_eq!(spec.value, 30.0);
        assert_eq!(spec.timeout, DEFAULT_ADMISSION_TIMEOUT);

        let config = LimitConfig {
            qps: 5.0,
            qpm: 100.0,
            timeout: 3,
            ..Default::default()
        };
        let spec = LimitSpec::from_config(&config).unwrap();
        assert_eq!(spec.kind, LimitKind::Qps);
        assert_eq!(spec.timeout, Duration::from_secs(3));

        assert!(LimitSpec::from_config(&LimitConfig::default()).is_none());
    }

    #[test]
    fn test_limit_spec_from_credentials() {
        let creds = json!({"api_key": "k", "limit": {"concurrency": 2, "timeout": 4}});
        let spec = LimitSpec::from_credentials(creds.as_object().unwrap()).unwrap();
        assert_eq!(spec.kind, LimitKind::Concurrency);
        assert_eq!(spec.value, 2.0);
        assert_eq!(spec.timeout, Duration::from_secs(4));

        let creds = json!({"limit": {"rpm": 12.5}});
        let spec = LimitSpec::from_credentials(creds.as_object().unwrap()).unwrap();
        assert_eq!(spec.kind, LimitKind::Qpm);
        assert_eq!(spec.value, 12.5);

        let creds = json!({"limit": "qps=3"});
        assert!(LimitSpec::from_credentials(creds.as_object().unwrap()).is_none());
        let creds = json!({"api_key": "k"});
        assert!(LimitSpec::from_credentials(creds.as_object().unwrap()).is_none());
    }

    #[test]
    fn test_huge_timeout_is_capped() {
        let config = LimitConfig {
            concurrency: 1.0,
            timeout: u64::MAX,
            ..Default::default()
        };
        let spec = LimitSpec::from_config(&config).unwrap();
        assert_eq!(spec.timeout, FAR_FUTURE);

        let creds = json!({"limit": {"qpm": 5, "timeout": 1e30}});
        let spec = LimitSpec::from_credentials(creds.as_object().unwrap()).unwrap();
        assert_eq!(spec.timeout, FAR_FUTURE);
    }

    #[tokio::test]
    async fn test_wait_context_saturates_deadline() {
        let ctx = ctx(Duration::MAX);
        assert!(ctx.deadline() > Instant::now() + Duration::from_secs(86_400));

        let limiter = Limiter::new(&spec(LimitKind::Concurrency, 1.0));
        assert!(limiter.acquire_slot(&ctx).await.unwrap().holds_slot());
    }

    #[tokio::test]
    async fn test_tiny_qps_admits_once_then_waits() {
        let limiter = Limiter::new(&spec(LimitKind::Qps, 1e-30));
        limiter.wait(&ctx(Duration::from_millis(50))).await.unwrap();
        assert_matches!(
            limiter.wait(&ctx(Duration::from_millis(50))).await,
            Err(WaitError::DeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn test_huge_concurrency_is_capped() {
        let limiter = Limiter::new(&spec(LimitKind::Concurrency, 1e19));
        assert_eq!(limiter.available_slots(), Some(Semaphore::MAX_PERMITS));

        let guard = limiter.acquire_slot(&ctx(Duration::from_secs(1))).await.unwrap();
        assert_eq!(limiter.available_slots(), Some(Semaphore::MAX_PERMITS - 1));
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_allows_up_to_capacity() {
        let window = SlidingWindowLimiter::per_minute(3);

        for _ in 0..3 {
            assert!(window.allow());
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert!(!window.allow());

        // 59.8s after the first admission: still full
        tokio::time::advance(Duration::from_millis(59_500)).await;
        assert!(!window.allow());

        // 60s after the first admission: one slot frees
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(window.allow());
        assert!(!window.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_wait_admits_when_oldest_expires() {
        let window = SlidingWindowLimiter::per_minute(1);
        assert!(window.allow());

        let start = Instant::now();
        Limiter::SlidingWindow(window)
            .wait(&ctx(Duration::from_secs(120)))
            .await
            .unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(60));
        assert!(waited < Duration::from_secs(62));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_wait_deadline() {
        let limiter = Limiter::new(&spec(LimitKind::Qpm, 1.0));
        limiter.wait(&ctx(Duration::from_secs(1))).await.unwrap();

        let result = limiter.wait(&ctx(Duration::from_secs(5))).await;
        assert_matches!(result, Err(WaitError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_canceled() {
        let limiter = Limiter::new(&spec(LimitKind::Qpm, 1.0));
        limiter.wait(&ctx(Duration::from_secs(1))).await.unwrap();

        let cancel = CancelHandle::new();
        let wait_ctx = WaitContext::new(Duration::from_secs(30), cancel.clone());
        let waiter = tokio::spawn(async move { limiter.wait(&wait_ctx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert_matches!(waiter.await.unwrap(), Err(WaitError::Canceled));
    }

    #[tokio::test]
    async fn test_token_bucket_burst_then_deadline() {
        let limiter = Limiter::new(&spec(LimitKind::Qps, 2.0));
        assert_eq!(limiter.kind(), LimitKind::Qps);

        limiter.wait(&ctx(Duration::from_millis(50))).await.unwrap();
        limiter.wait(&ctx(Duration::from_millis(50))).await.unwrap();

        // Next token arrives in ~500ms
        let result = limiter.wait(&ctx(Duration::from_millis(50))).await;
        assert_matches!(result, Err(WaitError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_fractional_qps_allows_one_token() {
        let limiter = Limiter::new(&spec(LimitKind::Qps, 0.5));
        limiter.wait(&ctx(Duration::from_millis(50))).await.unwrap();
        assert!(limiter.wait(&ctx(Duration::from_millis(50))).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_third_slot_waits_for_release() {
        let limiter = Arc::new(Limiter::new(&spec(LimitKind::Concurrency, 2.0)));

        let first = limiter.acquire_slot(&ctx(Duration::from_secs(10))).await.unwrap();
        let _second = limiter.acquire_slot(&ctx(Duration::from_secs(10))).await.unwrap();
        assert!(first.holds_slot());
        assert_eq!(limiter.available_slots(), Some(0));

        let third_limiter = limiter.clone();
        let third = tokio::spawn(async move {
            third_limiter
                .acquire_slot(&ctx(Duration::from_secs(10)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!third.is_finished());

        first.release();
        let guard = third.await.unwrap().unwrap();
        assert!(guard.holds_slot());
        assert_eq!(limiter.available_slots(), Some(0));

        drop(guard);
        assert_eq!(limiter.available_slots(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_acquire_deadline() {
        let limiter = Limiter::new(&spec(LimitKind::Concurrency, 1.0));
        let _held = limiter.acquire_slot(&ctx(Duration::from_secs(1))).await.unwrap();

        let result = limiter.acquire_slot(&ctx(Duration::from_secs(2))).await;
        assert_matches!(result, Err(WaitError::DeadlineExceeded));
        assert_eq!(limiter.available_slots(), Some(0));
    }

    #[tokio::test]
    async fn test_concurrency_wait_is_noop() {
        let limiter = Limiter::new(&spec(LimitKind::Concurrency, 1.0));
        let _held = limiter.acquire_slot(&ctx(Duration::from_secs(1))).await.unwrap();

        // All slots taken, but wait does not gate concurrency limiters
        limiter.wait(&ctx(Duration::from_millis(10))).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limiter_guard_holds_nothing() {
        let limiter = Limiter::new(&spec(LimitKind::Qpm, 10.0));
        let guard = limiter.admit(&ctx(Duration::from_secs(1))).await.unwrap();
        assert!(!guard.holds_slot());
        assert_eq!(limiter.available_slots(), None);
    }

    #[test]
    fn test_registry_memoizes_by_key() {
        let registry = LimiterRegistry::new();
        assert!(registry.is_empty());

        let a = registry.acquire("svc-1", &spec(LimitKind::Qpm, 10.0));
        let b = registry.acquire("svc-1", &spec(LimitKind::Concurrency, 3.0));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.kind(), LimitKind::Qpm);

        let c = registry.acquire("svc-2", &spec(LimitKind::Concurrency, 3.0));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("svc-2").is_some());
        assert!(registry.get("svc-3").is_none());
    }

    #[test]
    fn test_registry_concurrent_creation_yields_one_instance() {
        let registry = Arc::new(LimiterRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.acquire("shared", &spec(LimitKind::Qps, 5.0)))
            })
            .collect();

        let limiters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(limiters.iter().all(|l| Arc::ptr_eq(l, &limiters[0])));
        assert_eq!(registry.len(), 1);
    }
}
