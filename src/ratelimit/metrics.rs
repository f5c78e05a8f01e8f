//! Metrics sink injected into the limiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Something worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    /// Request admitted by the counter
    Allowed,
    /// Request denied for quota exhaustion
    Denied,
    /// Request admitted without counting (limit disabled)
    Bypassed,
    /// Entitlement archived or without a rate limit
    NoAccess,
    /// Fresh entitlement served from cache
    EntitlementCacheHit,
    /// Entitlement absent or stale in cache
    EntitlementCacheMiss,
    /// Remote entitlement lookup failed
    EntitlementRefreshFailed,
    /// Stale entitlement served after a failed refresh
    EntitlementServedStale,
    /// Counter store round trip failed
    StoreError,
}

/// Receives limiter events.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Shared handle to a sink that discards everything.
pub fn noop_metrics() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Counts events in memory.
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    bypassed: AtomicU64,
    no_access: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    refresh_failures: AtomicU64,
    served_stale: AtomicU64,
    store_errors: AtomicU64,
}

/// Point-in-time copy of [`AtomicMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub bypassed: u64,
    pub no_access: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub refresh_failures: u64,
    pub served_stale: u64,
    pub store_errors: u64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            no_access: self.no_access.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            served_stale: self.served_stale.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, event: MetricEvent) -> &AtomicU64 {
        match event {
            MetricEvent::Allowed => &self.allowed,
            MetricEvent::Denied => &self.denied,
            MetricEvent::Bypassed => &self.bypassed,
            MetricEvent::NoAccess => &self.no_access,
            MetricEvent::EntitlementCacheHit => &self.cache_hits,
            MetricEvent::EntitlementCacheMiss => &self.cache_misses,
            MetricEvent::EntitlementRefreshFailed => &self.refresh_failures,
            MetricEvent::EntitlementServedStale => &self.served_stale,
            MetricEvent::StoreError => &self.store_errors,
        }
    }
}

impl MetricsSink for AtomicMetrics {
    fn record(&self, event: MetricEvent) {
        self.counter(event).fetch_add(1, Ordering::Relaxed);
    }
}
