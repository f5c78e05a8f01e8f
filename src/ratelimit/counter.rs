//! Fixed-window admission over a shared counter store.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::key::CounterKey;
use super::metrics::{MetricEvent, MetricsSink};
use super::scope::{LimitConfig, Scope};
use crate::clock::Clock;
use crate::error::{Result, TollgateError};
use crate::store::CounterStore;

/// Upper bound on the TTL used to compute `retry_after` (about a century).
const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Details of a denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitExceeded {
    /// Scope whose quota is exhausted
    pub scope: Scope,
    /// Limit in force for the window
    pub limit: u64,
    /// Usage reported to the caller, never above `limit`
    pub used: u64,
    /// When the current window ends
    pub retry_after: DateTime<Utc>,
}

impl fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "you exceeded the rate limit for {}, only {} requests are allowed at the moment. Current usage: {}. Retry after {}",
            self.scope,
            self.limit,
            self.used,
            self.retry_after.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

impl std::error::Error for RateLimitExceeded {}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RateLimitDecision {
    Allow,
    Deny(RateLimitExceeded),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow)
    }

    /// Turn a denial into [`TollgateError::RateLimitExceeded`].
    pub fn into_result(self) -> Result<()> {
        match self {
            RateLimitDecision::Allow => Ok(()),
            RateLimitDecision::Deny(exceeded) => Err(exceeded.into()),
        }
    }
}

/// Counts requests per key in fixed windows.
///
/// The window of a key starts at its first increment and lasts until the
/// store expires the key. Increment and expiry are separate round trips and
/// deliberately not atomic together:
///
/// - concurrent first callers may all see no expiry and all set it; setting
///   the same expiry twice is harmless;
/// - a caller cancelled between the increment and the decision has spent a
///   request without getting an answer. Usage is overcounted by one, never
///   double-denied, and no lock is left behind.
///
/// Correctness relies only on the store's per-key atomic increment.
#[derive(Clone)]
pub struct FixedWindowCounter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl FixedWindowCounter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
        }
    }

    pub(crate) fn record(&self, event: MetricEvent) {
        self.metrics.record(event);
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Count one request against `key` and decide whether it is admitted.
    pub async fn acquire(
        &self,
        key: &CounterKey,
        scope: Scope,
        config: &LimitConfig,
    ) -> Result<RateLimitDecision> {
        if config.is_disabled() {
            self.record(MetricEvent::Bypassed);
            return Ok(RateLimitDecision::Allow);
        }

        trace!(key = %key, limit = config.limit, "Checking rate limit");

        // A missing key is created at 1.
        let count = self.observe(self.store.incr(key.as_str()).await)?;

        // A negative TTL means the window has no expiry yet: either this is
        // its first request or a previous caller failed before setting it.
        // An existing expiry is never touched, so the window boundary stays put.
        let mut ttl = self.observe(self.store.ttl(key.as_str()).await)?;
        if ttl < 0 {
            let window_secs = config.window_secs();
            let applied = self.observe(self.store.expire(key.as_str(), window_secs).await)?;
            debug!(
                key = %key,
                window_secs = window_secs,
                applied = applied,
                "Started rate limit window"
            );
            ttl = i64::try_from(window_secs).unwrap_or(i64::MAX);
        }

        let count = u64::try_from(count).unwrap_or(0);
        if count > config.limit {
            let retry_after = self.clock.now() + chrono::Duration::seconds(ttl.min(MAX_TTL_SECS));
            debug!(
                key = %key,
                count = count,
                limit = config.limit,
                retry_after = %retry_after,
                "Rate limit exceeded"
            );
            self.record(MetricEvent::Denied);
            // The counter keeps growing past the limit; report the limit.
            return Ok(RateLimitDecision::Deny(RateLimitExceeded {
                scope,
                limit: config.limit,
                used: count.min(config.limit),
                retry_after,
            }));
        }

        self.record(MetricEvent::Allowed);
        Ok(RateLimitDecision::Allow)
    }

    /// Current count for `key` without incrementing it.
    pub async fn current(&self, key: &CounterKey) -> Result<u64> {
        let value = self.observe(self.store.get(key.as_str()).await)?;
        match value {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| {
                TollgateError::Infrastructure(format!("counter at {key} is not an integer"))
            }),
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.record(MetricEvent::StoreError);
        }
        result
    }
}
