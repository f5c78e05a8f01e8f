//! Quota scopes and the limit applied to them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TollgateError;

/// Window used when nothing more specific is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// A named category of quota-limited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Chat and general completions
    Completion,
    /// Inline code completions
    CodeCompletion,
}

impl Scope {
    /// All supported scopes.
    pub const ALL: [Scope; 2] = [Scope::Completion, Scope::CodeCompletion];

    /// The stable name used in counter keys and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Completion => "completion",
            Scope::CodeCompletion => "code_completion",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| TollgateError::Config(format!("unknown scope: {s}")))
    }
}

/// The limit to enforce over a window.
///
/// A limit of zero disables limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum requests allowed in the window
    pub limit: u64,
    /// Length of the window
    pub window: Duration,
}

impl LimitConfig {
    /// Create a limit of `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// A limit that always allows.
    pub fn disabled() -> Self {
        Self::new(0, DEFAULT_WINDOW)
    }

    /// Whether this limit never denies.
    pub fn is_disabled(&self) -> bool {
        self.limit == 0
    }

    /// Window length in whole seconds, never less than one.
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_names_round_trip() {
        for scope in Scope::ALL {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
        }
        assert_eq!(Scope::CodeCompletion.to_string(), "code_completion");
    }

    #[test]
    fn test_unknown_scope_is_config_error() {
        let err = "embeddings".parse::<Scope>().unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[test]
    fn test_window_secs_floor() {
        let config = LimitConfig::new(10, Duration::from_millis(200));
        assert_eq!(config.window_secs(), 1);
        assert_eq!(LimitConfig::new(10, Duration::from_secs(3600)).window_secs(), 3600);
    }

    #[test]
    fn test_disabled() {
        assert!(LimitConfig::disabled().is_disabled());
        assert!(!LimitConfig::new(1, DEFAULT_WINDOW).is_disabled());
    }
}
