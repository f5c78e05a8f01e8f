//! Tollgate - Per-Actor Request Quotas
//!
//! This crate decides whether a request to a shared backend service may
//! proceed. Quotas are counted per scope for internal callers, authenticated
//! users, anonymous network origins, and externally-billed callers whose
//! limits come from a remote entitlement service. Counters live in a shared
//! store, so every instance enforces the same cluster-wide quota.

pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod ratelimit;
pub mod store;
