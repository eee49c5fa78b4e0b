//! Counter storage for fixed windows.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::RateLimitError;

/// Result of an atomic compare-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    /// Whether the counter was below the limit and has been incremented.
    pub allowed: bool,
    /// Counter value after the operation.
    pub count: u64,
}

/// Counter store abstraction.
///
/// Implementations must make `try_acquire` atomic: two concurrent callers can
/// never both observe `limit - 1` and both increment.
pub trait CounterStore: Send + Sync {
    /// Increment `key` if it is below `limit`. A fresh key expires at `expires_at`.
    fn try_acquire(
        &self,
        key: &str,
        limit: u64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Acquire, RateLimitError>;

    /// Current value of `key` (zero when absent or expired). Never increments.
    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<u64, RateLimitError>;

    /// Drop `key` entirely.
    fn clear(&self, key: &str) -> Result<(), RateLimitError>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Per-process counter store.
///
/// Expired windows are swept lazily, at most once per `sweep_every` acquisitions.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    inner: Mutex<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    entries: HashMap<String, Counter>,
    since_sweep: u32,
}

const SWEEP_EVERY: u32 = 1024;

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Counters::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Counters>, RateLimitError> {
        self.inner
            .lock()
            .map_err(|_| RateLimitError::Storage("counter store lock poisoned".to_string()))
    }

    /// Number of live (possibly expired but unswept) keys.
    pub fn len(&self) -> usize {
        self.lock().map(|c| c.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn try_acquire(
        &self,
        key: &str,
        limit: u64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Acquire, RateLimitError> {
        let mut counters = self.lock()?;

        counters.since_sweep += 1;
        if counters.since_sweep >= SWEEP_EVERY {
            counters.since_sweep = 0;
            counters.entries.retain(|_, c| c.expires_at > now);
        }

        let counter = counters
            .entries
            .entry(key.to_string())
            .or_insert(Counter { count: 0, expires_at });
        if counter.expires_at <= now {
            *counter = Counter { count: 0, expires_at };
        }

        if counter.count >= limit {
            return Ok(Acquire {
                allowed: false,
                count: counter.count,
            });
        }

        counter.count += 1;
        Ok(Acquire {
            allowed: true,
            count: counter.count,
        })
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> Result<u64, RateLimitError> {
        let counters = self.lock()?;
        Ok(counters
            .entries
            .get(key)
            .filter(|c| c.expires_at > now)
            .map_or(0, |c| c.count))
    }

    fn clear(&self, key: &str) -> Result<(), RateLimitError> {
        self.lock()?.entries.remove(key);
        Ok(())
    }
}
