//! Limiter strategy selected at construction.

use super::counter::RateLimitDecision;
use super::key::Actor;
use super::limiter::LocalLimiter;
use super::scope::Scope;
use super::subscription::SubscriptionLimiter;
use crate::error::{Result, TollgateError};

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// A local actor
    Actor(Actor),
    /// An externally-billed caller presenting an access token
    AccessToken(String),
}

/// A rate limiter for either kind of caller.
///
/// Both variants share the same fixed-window admission step; they only
/// differ in where the limit and the counter key come from.
pub enum RateLimiter {
    Local(LocalLimiter),
    Subscription(SubscriptionLimiter),
}

impl RateLimiter {
    /// Count one request and decide on it.
    pub async fn try_acquire(&self, caller: &Caller, scope: Scope) -> Result<RateLimitDecision> {
        match (self, caller) {
            (RateLimiter::Local(limiter), Caller::Actor(actor)) => {
                limiter.try_acquire(actor, scope).await
            }
            (RateLimiter::Subscription(limiter), Caller::AccessToken(token)) => {
                limiter.try_acquire(token, scope).await
            }
            (limiter, caller) => Err(limiter.mismatch(caller)),
        }
    }

    /// Requests counted for `caller` in the current window.
    pub async fn usage(&self, caller: &Caller, scope: Scope) -> Result<u64> {
        match (self, caller) {
            (RateLimiter::Local(limiter), Caller::Actor(actor)) => {
                limiter.usage(actor, scope).await
            }
            (RateLimiter::Subscription(limiter), Caller::AccessToken(token)) => {
                limiter.usage(token, scope).await
            }
            (limiter, caller) => Err(limiter.mismatch(caller)),
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), with a denial as an error.
    pub async fn check(&self, caller: &Caller, scope: Scope) -> Result<()> {
        self.try_acquire(caller, scope).await?.into_result()
    }

    fn mismatch(&self, caller: &Caller) -> TollgateError {
        let reason = match (self, caller) {
            (RateLimiter::Local(_), Caller::AccessToken(_)) => {
                "access tokens are not accepted by the local limiter"
            }
            _ => "an access token is required",
        };
        TollgateError::IdentityRequired(reason.to_string())
    }
}

impl From<LocalLimiter> for RateLimiter {
    fn from(limiter: LocalLimiter) -> Self {
        RateLimiter::Local(limiter)
    }
}

impl From<SubscriptionLimiter> for RateLimiter {
    fn from(limiter: SubscriptionLimiter) -> Self {
        RateLimiter::Subscription(limiter)
    }
}
