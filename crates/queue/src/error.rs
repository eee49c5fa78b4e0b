//! Errors surfaced by the queue facade.

use taskflow_core::TaskId;
use taskflow_ratelimit::RateLimitError;

use crate::store::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The task or queue store failed; `StoreError::Unavailable` means the
    /// backend could not be reached.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("worker pool already running")]
    AlreadyRunning,

    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

impl QueueError {
    /// Whether the failure was the backing store being unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            QueueError::Store(StoreError::Unavailable(_))
                | QueueError::RateLimit(RateLimitError::Unavailable(_))
        )
    }
}
