//! Quota: a limit per fixed window.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RateLimitError;

/// `limit` calls per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub limit: u64,
    pub window: Duration,
}

impl Quota {
    /// A zero-length window cannot be mapped to an index and is rejected.
    /// A zero limit is valid and denies everything.
    pub fn new(limit: u64, window: Duration) -> Result<Self, RateLimitError> {
        if window.as_millis() == 0 {
            return Err(RateLimitError::InvalidQuota(
                "window must be at least one millisecond".to_string(),
            ));
        }
        Ok(Self { limit, window })
    }

    pub fn per_second(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(1),
        }
    }

    pub fn per_minute(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
        }
    }

    pub fn per_hour(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(3600),
        }
    }

    pub(crate) fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX).max(1)
    }
}

/// Parses `"<limit>/<window_secs>"`, e.g. `"100/3600"`.
impl FromStr for Quota {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (limit, window) = s
            .split_once('/')
            .ok_or_else(|| RateLimitError::InvalidQuota(format!("expected limit/window_secs, got {s:?}")))?;
        let limit = limit
            .trim()
            .parse::<u64>()
            .map_err(|e| RateLimitError::InvalidQuota(format!("limit {limit:?}: {e}")))?;
        let window = window
            .trim()
            .parse::<u64>()
            .map_err(|e| RateLimitError::InvalidQuota(format!("window {window:?}: {e}")))?;
        Self::new(limit, Duration::from_secs(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_limit_over_window() {
        let quota: Quota = "100/3600".parse().unwrap();
        assert_eq!(quota, Quota::per_hour(100));

        let quota: Quota = " 5 / 60 ".parse().unwrap();
        assert_eq!(quota, Quota::per_minute(5));
    }

    #[test]
    fn rejects_malformed_quotas() {
        assert!("100".parse::<Quota>().is_err());
        assert!("x/60".parse::<Quota>().is_err());
        assert!("10/0".parse::<Quota>().is_err());
    }
}
