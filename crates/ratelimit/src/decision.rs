//! The answer to "may this call proceed?".

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one rate-limit check. Computed fresh on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    /// Calls left in the current window after this one.
    pub remaining: u64,
    /// Start of the next window.
    pub reset_at: DateTime<Utc>,
    /// Zero when allowed; otherwise the time until `reset_at`.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// `retry_after` rounded up to whole seconds, as HTTP wants it.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    /// Standard rate-limit response headers for the HTTP layer.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs().to_string()));
        }
        headers
    }
}
