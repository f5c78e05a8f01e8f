//! In-process counter store with Redis-compatible expiry semantics.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{CounterStore, TTL_MISSING, TTL_PERSISTENT};
use crate::clock::{system_clock, Clock};
use crate::error::{Result, TollgateError};

/// Seconds between sweeps that drop every expired key.
const SWEEP_INTERVAL_SECS: i64 = 60;

/// A stored value and its optional expiry.
#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn persistent(value: String) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Counter store kept in process memory.
///
/// Keys expire lazily on access, like Redis, and writes periodically sweep
/// out keys that expired without being touched again. Increments on a single
/// key are atomic through the map's per-entry locking; nothing is shared
/// between processes, so quotas enforced with this store are per-instance.
pub struct MemoryCounterStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    next_sweep: Mutex<DateTime<Utc>>,
}

impl MemoryCounterStore {
    /// Create an empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an empty store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let next_sweep = clock.now() + chrono::Duration::seconds(SWEEP_INTERVAL_SECS);
        Self {
            slots: DashMap::new(),
            clock,
            next_sweep: Mutex::new(next_sweep),
        }
    }

    /// Number of keys currently held, including not yet purged expired ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn purge_expired(&self, key: &str, now: DateTime<Utc>) {
        self.slots.remove_if(key, |_, slot| slot.is_expired(now));
    }

    /// Drop every expired key, at most once per sweep interval.
    ///
    /// Must not be called while holding a reference into `slots`.
    fn sweep_expired(&self, now: DateTime<Utc>) {
        {
            let mut next_sweep = self.next_sweep.lock();
            if now < *next_sweep {
                return;
            }
            *next_sweep = now + chrono::Duration::seconds(SWEEP_INTERVAL_SECS);
        }

        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.slots.len(), "Swept expired keys");
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        self.sweep_expired(now);

        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::persistent("0".to_string()));

        if slot.is_expired(now) {
            *slot = Slot::persistent("0".to_string());
        }

        let current: i64 = slot.value.parse().map_err(|_| {
            TollgateError::Infrastructure(format!("value at {key} is not an integer"))
        })?;
        let next = current + 1;
        slot.value = next.to_string();

        trace!(key = %key, count = next, "Incremented memory counter");
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        self.purge_expired(key, now);

        let ttl = match self.slots.get(key) {
            None => TTL_MISSING,
            Some(slot) => match slot.expires_at {
                None => TTL_PERSISTENT,
                // Round to the nearest second the way Redis does.
                Some(at) => ((at - now).num_milliseconds() + 500) / 1000,
            },
        };
        Ok(ttl)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let now = self.clock.now();
        self.purge_expired(key, now);

        let seconds = i64::try_from(seconds)
            .map_err(|_| TollgateError::Config(format!("expiry of {seconds}s is out of range")))?;
        match self.slots.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at = Some(now + chrono::Duration::seconds(seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        self.purge_expired(key, now);
        Ok(self.slots.get(key).map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.sweep_expired(self.clock.now());
        self.slots
            .insert(key.to_string(), Slot::persistent(value.to_string()));
        Ok(())
    }
}
