//! Remote entitlements for externally-billed callers.
//!
//! The remote lookup client lives outside this crate; it only has to
//! implement [`EntitlementSource`]. [`StaticEntitlementSource`] serves
//! entitlements from a YAML file for single-node use.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, TollgateError};
use crate::ratelimit::LimitConfig;

/// Rate limit granted by an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRateLimit {
    /// Requests allowed per interval
    pub limit: u64,
    /// Interval length in seconds
    pub interval_seconds: u64,
}

impl EntitlementRateLimit {
    /// The limit as enforced by the local counter.
    ///
    /// Returns `None` for a zero limit or a zero-length interval; neither
    /// grants usable access. A zero `LimitConfig` would mean unlimited.
    pub fn limit_config(&self) -> Option<LimitConfig> {
        if self.limit == 0 || self.interval_seconds == 0 {
            return None;
        }
        Some(LimitConfig::new(
            self.limit,
            Duration::from_secs(self.interval_seconds),
        ))
    }
}

/// A remotely held record of what a paid subscription may consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Stable id shared by every access token issued under the entitlement
    pub id: Uuid,
    /// Archived entitlements grant no access
    #[serde(default)]
    pub archived: bool,
    /// Absent when no access has been configured
    #[serde(default)]
    pub rate_limit: Option<EntitlementRateLimit>,
}

/// Looks up the entitlement behind an access token.
///
/// A token the source does not know is [`TollgateError::NoAccess`]. Any
/// other failure is reported as [`TollgateError::Infrastructure`], never as
/// an access decision.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn lookup(&self, token: &str) -> Result<Entitlement>;
}

/// Entitlements keyed by access token, as read from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticEntitlementSource {
    #[serde(default)]
    tokens: HashMap<String, Entitlement>,
}

impl StaticEntitlementSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load entitlements from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading entitlements");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load entitlements from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse entitlements: {e}")))
    }

    /// Grant `entitlement` to `token`.
    pub fn with_token(mut self, token: impl Into<String>, entitlement: Entitlement) -> Self {
        self.tokens.insert(token.into(), entitlement);
        self
    }
}

#[async_trait]
impl EntitlementSource for StaticEntitlementSource {
    async fn lookup(&self, token: &str) -> Result<Entitlement> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| TollgateError::NoAccess("unknown access token".to_string()))
    }
}
