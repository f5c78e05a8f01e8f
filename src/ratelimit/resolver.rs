//! Limit resolution.

use std::sync::Arc;

use tracing::trace;

use super::key::Actor;
use super::rules::LimitSource;
use super::scope::{LimitConfig, Scope, DEFAULT_WINDOW};
use crate::error::{Result, TollgateError};

/// Resolves the limit to enforce for an (actor, scope) pair.
///
/// Precedence:
/// 1. internal actors are never limited;
/// 2. an authenticated user's override, including an explicit zero;
/// 3. the scope's global limit;
/// 4. nothing configured disables limiting.
#[derive(Clone)]
pub struct LimitResolver {
    source: Arc<dyn LimitSource>,
}

impl LimitResolver {
    pub fn new(source: Arc<dyn LimitSource>) -> Self {
        Self { source }
    }

    /// Resolve the limit for an actor.
    pub async fn resolve(&self, actor: &Actor, scope: Scope) -> Result<LimitConfig> {
        if actor.is_internal() {
            return Ok(LimitConfig::disabled());
        }

        let global = self.source.global_limit(scope).await?;

        if let Some(user_id) = actor.user_id() {
            // An override lookup failure must not fall back to the global limit.
            let user_override = self
                .source
                .user_override(user_id, scope)
                .await
                .map_err(|e| match e {
                    TollgateError::Infrastructure(_) => e,
                    other => TollgateError::Infrastructure(format!(
                        "failed to read limit override for user {user_id}: {other}"
                    )),
                })?;

            if let Some(limit) = user_override {
                trace!(
                    user_id = user_id,
                    scope = %scope,
                    limit = limit,
                    "Using per-user limit override"
                );
                let window = global.map_or(DEFAULT_WINDOW, |g| g.window);
                return Ok(LimitConfig::new(limit, window));
            }
        }

        Ok(global.unwrap_or_else(LimitConfig::disabled))
    }

    /// Resolve the limit for a scope given by name.
    pub async fn resolve_named(&self, actor: &Actor, scope: &str) -> Result<LimitConfig> {
        let scope: Scope = scope.parse()?;
        self.resolve(actor, scope).await
    }
}
