//! Fixed-window limiter over a [`CounterStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use taskflow_core::{SharedClock, SystemClock};

use crate::decision::RateLimitDecision;
use crate::error::RateLimitError;
use crate::quota::Quota;
use crate::store::{CounterStore, InMemoryCounterStore};

const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Answers "is the next call for this identifier allowed?" under a quota.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    prefix: String,
}

impl core::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("clock", &self.clock)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// The window a timestamp falls into.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Window {
    key: String,
    reset_at: DateTime<Utc>,
    until_reset: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Per-process limiter on the system clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCounterStore::new()), SystemClock::shared())
    }

    /// Namespace prepended to every counter key.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn window(&self, identifier: &str, quota: &Quota, now: DateTime<Utc>) -> Window {
        let window_ms = quota.window_millis();
        let now_ms = now.timestamp_millis();
        let index = now_ms.div_euclid(window_ms);
        let reset_ms = (index + 1).saturating_mul(window_ms);

        Window {
            key: format!("{}:{}:{}:{}", self.prefix, identifier, window_ms, index),
            reset_at: DateTime::from_timestamp_millis(reset_ms).unwrap_or(now),
            until_reset: Duration::from_millis((reset_ms - now_ms).max(0) as u64),
        }
    }

    /// Count this call against `identifier` if the quota allows it.
    pub fn check(&self, identifier: &str, quota: &Quota) -> Result<RateLimitDecision, RateLimitError> {
        let now = self.clock.now();
        let window = self.window(identifier, quota, now);

        let acquired = self
            .store
            .try_acquire(&window.key, quota.limit, now, window.reset_at)?;

        if acquired.allowed {
            Ok(RateLimitDecision {
                allowed: true,
                limit: quota.limit,
                remaining: quota.limit.saturating_sub(acquired.count),
                reset_at: window.reset_at,
                retry_after: Duration::ZERO,
            })
        } else {
            debug!(identifier, limit = quota.limit, retry_after_ms = window.until_reset.as_millis() as u64, "rate limit exceeded");
            Ok(RateLimitDecision {
                allowed: false,
                limit: quota.limit,
                remaining: 0,
                reset_at: window.reset_at,
                retry_after: window.until_reset,
            })
        }
    }

    /// Current standing for `identifier` without counting a call.
    pub fn info(&self, identifier: &str, quota: &Quota) -> Result<RateLimitDecision, RateLimitError> {
        let now = self.clock.now();
        let window = self.window(identifier, quota, now);
        let count = self.store.get(&window.key, now)?;
        let exhausted = count >= quota.limit;

        Ok(RateLimitDecision {
            allowed: !exhausted,
            limit: quota.limit,
            remaining: quota.limit.saturating_sub(count),
            reset_at: window.reset_at,
            retry_after: if exhausted { window.until_reset } else { Duration::ZERO },
        })
    }

    /// Clear the current window's counter for `identifier`.
    pub fn reset(&self, identifier: &str, quota: &Quota) -> Result<(), RateLimitError> {
        let window = self.window(identifier, quota, self.clock.now());
        self.store.clear(&window.key)
    }
}
