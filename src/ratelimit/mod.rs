//! Rate limiting logic.

mod backend;
mod counter;
mod key;
mod limiter;
mod metrics;
mod resolver;
mod rules;
mod scope;
mod subscription;

pub use backend::{Caller, RateLimiter};
pub use counter::{FixedWindowCounter, RateLimitDecision, RateLimitExceeded};
pub use key::{Actor, CounterKey, Origin};
pub use limiter::LocalLimiter;
pub use metrics::{
    noop_metrics, AtomicMetrics, MetricEvent, MetricsSink, MetricsSnapshot, NoopMetrics,
};
pub use resolver::LimitResolver;
pub use rules::{
    LimitSource, OverrideRules, RateLimitRules, ScopeRule, StaticLimitSource, TimeUnit,
};
pub use scope::{LimitConfig, Scope, DEFAULT_WINDOW};
pub use subscription::{
    CachedEntitlement, EntitlementCache, LocalEntitlementCache, StoreEntitlementCache,
    SubscriptionLimiter, SubscriptionSettings, DEFAULT_STALENESS_HORIZON,
};
