//! Limiter for externally-billed callers.
//!
//! The caller presents an opaque access token. The entitlement behind it is
//! fetched from the remote source, cached until it goes stale, and its rate
//! limit is enforced by the same fixed-window counter used for local actors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::counter::{FixedWindowCounter, RateLimitDecision};
use super::key::CounterKey;
use super::metrics::MetricEvent;
use super::scope::Scope;
use crate::entitlement::{Entitlement, EntitlementSource};
use crate::error::{Result, TollgateError};
use crate::store::CounterStore;

/// Default age after which a cached entitlement is refreshed.
pub const DEFAULT_STALENESS_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

/// An entitlement as remembered by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntitlement {
    #[serde(flatten)]
    pub entitlement: Entitlement,
    /// After this instant the entry must be refreshed
    pub stale_at: DateTime<Utc>,
}

impl CachedEntitlement {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.stale_at
    }
}

/// Storage for cached entitlements, keyed by access token.
///
/// Entries are overwritten on refresh and never deleted.
#[async_trait]
pub trait EntitlementCache: Send + Sync {
    async fn get(&self, token: &str) -> Result<Option<CachedEntitlement>>;
    async fn put(&self, token: &str, entry: &CachedEntitlement) -> Result<()>;
}

/// Cache local to this process.
#[derive(Debug, Default)]
pub struct LocalEntitlementCache {
    entries: DashMap<String, CachedEntitlement>,
}

impl LocalEntitlementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl EntitlementCache for LocalEntitlementCache {
    async fn get(&self, token: &str) -> Result<Option<CachedEntitlement>> {
        Ok(self.entries.get(token).map(|entry| entry.clone()))
    }

    async fn put(&self, token: &str, entry: &CachedEntitlement) -> Result<()> {
        self.entries.insert(token.to_string(), entry.clone());
        Ok(())
    }
}

/// Cache kept as JSON in the counter store, shared by every process using it.
#[derive(Clone)]
pub struct StoreEntitlementCache {
    store: Arc<dyn CounterStore>,
}

impl StoreEntitlementCache {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    fn key(token: &str) -> String {
        format!("entitlement_cache:{token}")
    }
}

#[async_trait]
impl EntitlementCache for StoreEntitlementCache {
    async fn get(&self, token: &str) -> Result<Option<CachedEntitlement>> {
        let Some(raw) = self.store.get(&Self::key(token)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable cached entitlement");
                Ok(None)
            }
        }
    }

    async fn put(&self, token: &str, entry: &CachedEntitlement) -> Result<()> {
        let raw = serde_json::to_string(entry).map_err(|e| {
            TollgateError::Infrastructure(format!("failed to encode cached entitlement: {e}"))
        })?;
        self.store.set(&Self::key(token), &raw).await
    }
}

/// Tuning for [`SubscriptionLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionSettings {
    /// How long a fetched entitlement is used before refreshing
    pub staleness_horizon: Duration,
    /// Serve a stale cached entitlement when the refresh fails
    pub serve_stale_on_error: bool,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            staleness_horizon: DEFAULT_STALENESS_HORIZON,
            serve_stale_on_error: true,
        }
    }
}

/// Rate limiter for callers identified by an access token.
pub struct SubscriptionLimiter {
    source: Arc<dyn EntitlementSource>,
    cache: Arc<dyn EntitlementCache>,
    counter: FixedWindowCounter,
    settings: SubscriptionSettings,
}

impl SubscriptionLimiter {
    pub fn new(
        source: Arc<dyn EntitlementSource>,
        cache: Arc<dyn EntitlementCache>,
        counter: FixedWindowCounter,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            source,
            cache,
            counter,
            settings,
        }
    }

    /// Count one request for the entitlement behind `token`.
    ///
    /// Archived entitlements and entitlements without a usable rate limit are
    /// refused with [`TollgateError::NoAccess`], whatever the counter says.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn try_acquire(&self, token: &str, scope: Scope) -> Result<RateLimitDecision> {
        if token.trim().is_empty() {
            return Err(TollgateError::IdentityRequired(
                "an access token is required".to_string(),
            ));
        }

        let entitlement = self.entitlement(token).await?;

        if entitlement.archived {
            self.counter.record(MetricEvent::NoAccess);
            return Err(TollgateError::NoAccess(format!(
                "entitlement {} is archived",
                entitlement.id
            )));
        }

        let Some(config) = entitlement.rate_limit.and_then(|r| r.limit_config()) else {
            self.counter.record(MetricEvent::NoAccess);
            return Err(TollgateError::NoAccess(format!(
                "entitlement {} has no usable rate limit",
                entitlement.id
            )));
        };

        let key = CounterKey::for_entitlement(&entitlement.id, scope);
        self.counter.acquire(&key, scope, &config).await
    }

    /// Requests counted for the entitlement behind `token` in the current
    /// window, without counting one.
    pub async fn usage(&self, token: &str, scope: Scope) -> Result<u64> {
        let entitlement = self.entitlement(token).await?;
        self.counter
            .current(&CounterKey::for_entitlement(&entitlement.id, scope))
            .await
    }

    /// Resolve the entitlement behind `token`, from cache when fresh.
    pub async fn entitlement(&self, token: &str) -> Result<Entitlement> {
        let now = self.counter.clock().now();

        // The cache is an optimization; an unreadable cache is a miss.
        let cached = match self.cache.get(token).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "Failed to read entitlement cache");
                None
            }
        };

        if let Some(entry) = &cached {
            if entry.is_fresh(now) {
                self.counter.record(MetricEvent::EntitlementCacheHit);
                return Ok(entry.entitlement.clone());
            }
        }
        self.counter.record(MetricEvent::EntitlementCacheMiss);

        match self.source.lookup(token).await {
            Ok(entitlement) => {
                debug!(entitlement = %entitlement.id, "Fetched entitlement");
                let entry = CachedEntitlement {
                    entitlement: entitlement.clone(),
                    stale_at: now + horizon(self.settings.staleness_horizon),
                };
                if let Err(e) = self.cache.put(token, &entry).await {
                    warn!(entitlement = %entitlement.id, error = %e, "Failed to cache entitlement");
                }
                Ok(entitlement)
            }
            // The source refused the token outright; a cached grant is no
            // longer trusted.
            Err(err @ TollgateError::NoAccess(_)) => {
                self.counter.record(MetricEvent::NoAccess);
                Err(err)
            }
            Err(err) => {
                self.counter.record(MetricEvent::EntitlementRefreshFailed);
                match cached {
                    // Not written back: the next call retries the lookup.
                    Some(entry) if self.settings.serve_stale_on_error => {
                        warn!(
                            entitlement = %entry.entitlement.id,
                            stale_at = %entry.stale_at,
                            error = %err,
                            "Entitlement refresh failed, serving stale entry"
                        );
                        self.counter.record(MetricEvent::EntitlementServedStale);
                        Ok(entry.entitlement)
                    }
                    _ => Err(match err {
                        TollgateError::Infrastructure(_) => err,
                        other => TollgateError::Infrastructure(format!(
                            "entitlement lookup failed: {other}"
                        )),
                    }),
                }
            }
        }
    }
}

fn horizon(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entitlement::{EntitlementRateLimit, StaticEntitlementSource};
    use crate::ratelimit::counter::tests::{start, InstrumentedStore};
    use crate::ratelimit::metrics::AtomicMetrics;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Entitlement source that counts lookups.
    struct CountingSource {
        entitlement: Mutex<Entitlement>,
        lookups: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingSource {
        fn new(entitlement: Entitlement) -> Self {
            Self {
                entitlement: Mutex::new(entitlement),
                lookups: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EntitlementSource for CountingSource {
        async fn lookup(&self, _token: &str) -> Result<Entitlement> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(TollgateError::Infrastructure(
                    "entitlement service unavailable".to_string(),
                ));
            }
            Ok(self.entitlement.lock().clone())
        }
    }

    /// Cache whose writes always fail.
    struct ReadOnlyCache;

    #[async_trait]
    impl EntitlementCache for ReadOnlyCache {
        async fn get(&self, _token: &str) -> Result<Option<CachedEntitlement>> {
            Ok(None)
        }

        async fn put(&self, _token: &str, _entry: &CachedEntitlement) -> Result<()> {
            Err(TollgateError::Infrastructure("read-only replica".to_string()))
        }
    }

    fn entitlement(limit: u64) -> Entitlement {
        Entitlement {
            id: Uuid::from_u128(0x1234),
            archived: false,
            rate_limit: Some(EntitlementRateLimit {
                limit,
                interval_seconds: 3600,
            }),
        }
    }

    struct Fixture {
        limiter: SubscriptionLimiter,
        source: Arc<CountingSource>,
        clock: Arc<ManualClock>,
        metrics: Arc<AtomicMetrics>,
    }

    fn fixture_with(
        entitlement: Entitlement,
        cache: Arc<dyn EntitlementCache>,
        settings: SubscriptionSettings,
    ) -> Fixture {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InstrumentedStore::new(clock.clone()));
        let metrics = Arc::new(AtomicMetrics::new());
        let source = Arc::new(CountingSource::new(entitlement));
        let counter = FixedWindowCounter::new(store, clock.clone(), metrics.clone());
        let limiter = SubscriptionLimiter::new(source.clone(), cache, counter, settings);
        Fixture {
            limiter,
            source,
            clock,
            metrics,
        }
    }

    fn fixture(entitlement: Entitlement) -> Fixture {
        fixture_with(
            entitlement,
            Arc::new(LocalEntitlementCache::new()),
            SubscriptionSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_single_fetch_within_horizon() {
        let f = fixture(entitlement(100));

        f.limiter.try_acquire("token-a", Scope::Completion).await.unwrap();
        f.clock.advance(Duration::from_secs(23 * 3600));
        f.limiter.try_acquire("token-a", Scope::Completion).await.unwrap();
        assert_eq!(f.source.lookups(), 1);

        f.clock.advance(Duration::from_secs(3600));
        f.limiter.try_acquire("token-a", Scope::Completion).await.unwrap();
        assert_eq!(f.source.lookups(), 2);

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 2);
    }

    #[tokio::test]
    async fn test_archived_is_no_access() {
        let mut archived = entitlement(100);
        archived.archived = true;
        let f = fixture(archived);

        for _ in 0..3 {
            let err = f.limiter.try_acquire("token", Scope::Completion).await.unwrap_err();
            assert!(matches!(err, TollgateError::NoAccess(_)));
        }
        assert_eq!(f.metrics.snapshot().no_access, 3);
        assert_eq!(f.metrics.snapshot().allowed, 0);
    }

    #[tokio::test]
    async fn test_missing_rate_limit_is_no_access() {
        let mut no_limit = entitlement(100);
        no_limit.rate_limit = None;
        let f = fixture(no_limit);

        let err = f.limiter.try_acquire("token", Scope::Completion).await.unwrap_err();
        assert!(matches!(err, TollgateError::NoAccess(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_zero_limit_is_no_access() {
        let f = fixture(entitlement(0));

        for _ in 0..10 {
            let err = f
                .limiter
                .try_acquire("token", Scope::Completion)
                .await
                .unwrap_err();
            assert!(matches!(err, TollgateError::NoAccess(_)));
        }
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.no_access, 10);
        assert_eq!(snapshot.allowed, 0);
        assert_eq!(snapshot.bypassed, 0);
    }

    #[tokio::test]
    async fn test_tokens_share_entitlement_quota() {
        let f = fixture(entitlement(3));

        for token in ["token-a", "token-b", "token-a"] {
            assert!(f
                .limiter
                .try_acquire(token, Scope::Completion)
                .await
                .unwrap()
                .is_allowed());
        }
        let decision = f.limiter.try_acquire("token-b", Scope::Completion).await.unwrap();
        assert!(!decision.is_allowed());

        // Separate scopes keep separate counters.
        assert!(f
            .limiter
            .try_acquire("token-b", Scope::CodeCompletion)
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_cache_write_failure_does_not_block() {
        let f = fixture_with(
            entitlement(10),
            Arc::new(ReadOnlyCache),
            SubscriptionSettings::default(),
        );

        assert!(f
            .limiter
            .try_acquire("token", Scope::Completion)
            .await
            .unwrap()
            .is_allowed());
        // Nothing was cached, so every call fetches.
        f.limiter.try_acquire("token", Scope::Completion).await.unwrap();
        assert_eq!(f.source.lookups(), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_serves_stale_entry() {
        let f = fixture(entitlement(10));

        f.limiter.try_acquire("token", Scope::Completion).await.unwrap();
        f.clock.advance(DEFAULT_STALENESS_HORIZON);
        f.source.fail.store(true, Ordering::SeqCst);

        assert!(f
            .limiter
            .try_acquire("token", Scope::Completion)
            .await
            .unwrap()
            .is_allowed());
        assert_eq!(f.metrics.snapshot().served_stale, 1);

        // The stale entry was not renewed, so the next call tries again.
        f.limiter.try_acquire("token", Scope::Completion).await.unwrap();
        assert_eq!(f.source.lookups(), 3);
    }

    #[tokio::test]
    async fn test_refresh_failure_without_fallback() {
        let f = fixture_with(
            entitlement(10),
            Arc::new(LocalEntitlementCache::new()),
            SubscriptionSettings {
                serve_stale_on_error: false,
                ..SubscriptionSettings::default()
            },
        );

        f.limiter.try_acquire("token", Scope::Completion).await.unwrap();
        f.clock.advance(DEFAULT_STALENESS_HORIZON);
        f.source.fail.store(true, Ordering::SeqCst);

        let err = f.limiter.try_acquire("token", Scope::Completion).await.unwrap_err();
        assert!(matches!(err, TollgateError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn test_lookup_failure_without_cache_entry() {
        let f = fixture(entitlement(10));
        f.source.fail.store(true, Ordering::SeqCst);

        let err = f.limiter.try_acquire("token", Scope::Completion).await.unwrap_err();
        assert!(matches!(err, TollgateError::Infrastructure(_)));
    }

    #[tokio::test]
    async fn test_empty_token_requires_identity() {
        let f = fixture(entitlement(10));
        let err = f.limiter.try_acquire(" ", Scope::Completion).await.unwrap_err();
        assert!(matches!(err, TollgateError::IdentityRequired(_)));
        assert_eq!(f.source.lookups(), 0);
    }

    #[tokio::test]
    async fn test_archival_observed_after_horizon() {
        let f = fixture(entitlement(10));

        f.limiter.try_acquire("token", Scope::Completion).await.unwrap();
        f.source.entitlement.lock().archived = true;

        // Still cached as active.
        assert!(f
            .limiter
            .try_acquire("token", Scope::Completion)
            .await
            .unwrap()
            .is_allowed());

        f.clock.advance(DEFAULT_STALENESS_HORIZON);
        let err = f.limiter.try_acquire("token", Scope::Completion).await.unwrap_err();
        assert!(matches!(err, TollgateError::NoAccess(_)));
    }

    #[tokio::test]
    async fn test_store_cache_round_trips_through_counter_store() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InstrumentedStore::new(clock.clone()));
        let cache = StoreEntitlementCache::new(store.clone());
        let entry = CachedEntitlement {
            entitlement: entitlement(5),
            stale_at: start(),
        };

        cache.put("token", &entry).await.unwrap();
        assert_eq!(cache.get("token").await.unwrap(), Some(entry));
        assert!(store.get("entitlement_cache:token").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_cache_discards_corrupt_entry() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InstrumentedStore::new(clock.clone()));
        store.set("entitlement_cache:token", "{not json").await.unwrap();

        let cache = StoreEntitlementCache::new(store);
        assert_eq!(cache.get("token").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_revoked_token_is_not_served_stale() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InstrumentedStore::new(clock.clone()));
        let metrics = Arc::new(AtomicMetrics::new());
        let cache = Arc::new(LocalEntitlementCache::new());
        cache
            .put(
                "token",
                &CachedEntitlement {
                    entitlement: entitlement(10),
                    stale_at: start(),
                },
            )
            .await
            .unwrap();

        let limiter = SubscriptionLimiter::new(
            Arc::new(StaticEntitlementSource::new()),
            cache,
            FixedWindowCounter::new(store, clock, metrics.clone()),
            SubscriptionSettings::default(),
        );

        let err = limiter
            .try_acquire("token", Scope::Completion)
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::NoAccess(_)));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.served_stale, 0);
        assert_eq!(snapshot.refresh_failures, 0);
        assert_eq!(snapshot.no_access, 1);
    }

    #[tokio::test]
    async fn test_usage_reads_entitlement_counter() {
        let f = fixture(entitlement(10));

        assert_eq!(f.limiter.usage("token-a", Scope::Completion).await.unwrap(), 0);
        f.limiter.try_acquire("token-a", Scope::Completion).await.unwrap();
        f.limiter.try_acquire("token-b", Scope::Completion).await.unwrap();

        assert_eq!(f.limiter.usage("token-a", Scope::Completion).await.unwrap(), 2);
        assert_eq!(f.limiter.usage("token-a", Scope::CodeCompletion).await.unwrap(), 0);
    }
}
