//! Rate limiter for local actors.

use tracing::{instrument, trace};

use super::counter::{FixedWindowCounter, RateLimitDecision};
use super::key::{Actor, CounterKey};
use super::metrics::MetricEvent;
use super::resolver::LimitResolver;
use super::scope::Scope;
use crate::error::Result;

/// Enforces quotas for internal callers, users and anonymous origins.
///
/// This struct holds no lock and can be shared across tasks; all shared
/// state lives in the counter store.
#[derive(Clone)]
pub struct LocalLimiter {
    resolver: LimitResolver,
    counter: FixedWindowCounter,
}

impl LocalLimiter {
    pub fn new(resolver: LimitResolver, counter: FixedWindowCounter) -> Self {
        Self { resolver, counter }
    }

    /// Count one request for `actor` in `scope` and decide on it.
    ///
    /// A disabled limit admits without touching the store, so an anonymous
    /// caller without an address is only refused when a limit applies.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn try_acquire(&self, actor: &Actor, scope: Scope) -> Result<RateLimitDecision> {
        let config = self.resolver.resolve(actor, scope).await?;
        if config.is_disabled() {
            trace!(actor = ?actor, "Rate limiting disabled");
            self.counter.record(MetricEvent::Bypassed);
            return Ok(RateLimitDecision::Allow);
        }

        let Some(key) = CounterKey::for_actor(actor, scope)? else {
            self.counter.record(MetricEvent::Bypassed);
            return Ok(RateLimitDecision::Allow);
        };

        self.counter.acquire(&key, scope, &config).await
    }

    /// Count one request for a scope given by name.
    pub async fn try_acquire_named(&self, actor: &Actor, scope: &str) -> Result<RateLimitDecision> {
        let scope: Scope = scope.parse()?;
        self.try_acquire(actor, scope).await
    }

    /// Requests counted for `actor` in the current window, without counting one.
    pub async fn usage(&self, actor: &Actor, scope: Scope) -> Result<u64> {
        match CounterKey::for_actor(actor, scope)? {
            Some(key) => self.counter.current(&key).await,
            None => Ok(0),
        }
    }
}
