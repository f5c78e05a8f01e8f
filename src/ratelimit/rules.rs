//! Limit rules configuration.
//!
//! Global per-scope limits and per-user overrides are read through a
//! [`LimitSource`]. The bundled [`StaticLimitSource`] loads them from YAML:
//!
//! ```yaml
//! scopes:
//!   completion:
//!     limit: 5
//!     window: day
//!   code_completion:
//!     limit: 1000
//!     window_secs: 3600
//! overrides:
//!   users:
//!     42:
//!       completion: 0
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::scope::{LimitConfig, Scope, DEFAULT_WINDOW};
use crate::error::{Result, TollgateError};

/// Where limits come from.
///
/// Implementations report lookup failures as
/// [`TollgateError::Infrastructure`]. Results are not cached by callers, so
/// changes apply on the next resolution.
#[async_trait]
pub trait LimitSource: Send + Sync {
    /// The globally configured limit for a scope, if any.
    async fn global_limit(&self, scope: Scope) -> Result<Option<LimitConfig>>;

    /// A per-user override of the limit. `Some(0)` disables limiting.
    async fn user_override(&self, user_id: i64, scope: Scope) -> Result<Option<u64>>;
}

/// Time unit for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// The limit configured for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    /// Requests allowed per window
    pub limit: u64,
    /// Window as a unit of time
    #[serde(default)]
    pub window: Option<TimeUnit>,
    /// Window in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
}

impl ScopeRule {
    fn validate(&self, scope: Scope) -> Result<()> {
        match (self.window, self.window_secs) {
            (Some(_), Some(_)) => Err(TollgateError::Config(format!(
                "scope {scope}: set either window or window_secs, not both"
            ))),
            (None, Some(0)) => Err(TollgateError::Config(format!(
                "scope {scope}: window_secs must be greater than zero"
            ))),
            _ => Ok(()),
        }
    }

    /// The limit and window this rule describes.
    pub fn limit_config(&self) -> LimitConfig {
        let window = match (self.window, self.window_secs) {
            (Some(unit), _) => unit.duration(),
            (None, Some(secs)) => Duration::from_secs(secs),
            (None, None) => DEFAULT_WINDOW,
        };
        LimitConfig::new(self.limit, window)
    }
}

/// Per-actor overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRules {
    /// User id -> scope -> limit
    #[serde(default)]
    pub users: HashMap<i64, HashMap<Scope, u64>>,
}

/// A complete set of limit rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Global limit per scope
    #[serde(default)]
    pub scopes: HashMap<Scope, ScopeRule>,
    /// Per-actor overrides
    #[serde(default)]
    pub overrides: OverrideRules,
}

impl RateLimitRules {
    /// Create an empty rule set. Every scope is disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Config(format!("Failed to parse rate limit rules: {e}"))
        })?;

        for (scope, rule) in &rules.scopes {
            rule.validate(*scope)?;
        }

        Ok(rules)
    }

    /// Set the global limit for a scope.
    pub fn with_scope(mut self, scope: Scope, limit: u64, window: Duration) -> Self {
        self.scopes.insert(
            scope,
            ScopeRule {
                limit,
                window: None,
                window_secs: Some(window.as_secs().max(1)),
            },
        );
        self
    }

    /// Set a per-user override for a scope.
    pub fn with_user_override(mut self, user_id: i64, scope: Scope, limit: u64) -> Self {
        self.overrides
            .users
            .entry(user_id)
            .or_default()
            .insert(scope, limit);
        self
    }

    pub fn global_limit(&self, scope: Scope) -> Option<LimitConfig> {
        self.scopes.get(&scope).map(ScopeRule::limit_config)
    }

    pub fn user_override(&self, user_id: i64, scope: Scope) -> Option<u64> {
        self.overrides
            .users
            .get(&user_id)
            .and_then(|scopes| scopes.get(&scope))
            .copied()
    }
}

/// A [`LimitSource`] over rules held in memory.
///
/// Rules can be swapped at runtime; readers see the new rules on their next
/// lookup.
#[derive(Debug, Default)]
pub struct StaticLimitSource {
    rules: RwLock<RateLimitRules>,
}

impl StaticLimitSource {
    pub fn new(rules: RateLimitRules) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(RateLimitRules::from_file(path)?))
    }

    /// Replace the rules.
    pub fn set_rules(&self, rules: RateLimitRules) {
        *self.rules.write() = rules;
    }

    /// Get the current rules.
    pub fn rules(&self) -> RateLimitRules {
        self.rules.read().clone()
    }
}

#[async_trait]
impl LimitSource for StaticLimitSource {
    async fn global_limit(&self, scope: Scope) -> Result<Option<LimitConfig>> {
        Ok(self.rules.read().global_limit(scope))
    }

    async fn user_override(&self, user_id: i64, scope: Scope) -> Result<Option<u64>> {
        Ok(self.rules.read().user_override(user_id, scope))
    }
}
