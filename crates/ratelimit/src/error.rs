use thiserror::Error;

/// Rate-limit failure. A denied request is *not* an error; see
/// [`RateLimitDecision::allowed`](crate::RateLimitDecision::allowed).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The counter backend could not be reached. Callers decide the fallback.
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),

    /// The counter backend answered with something unexpected.
    #[error("rate limit store error: {0}")]
    Storage(String),

    #[error("invalid quota: {0}")]
    InvalidQuota(String),

    #[error("unknown rate limit scope: {0}")]
    UnknownScope(String),
}
