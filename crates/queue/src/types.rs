//! Core task types and policies.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskflow_core::{CoreError, Payload, TaskId};

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task priority. Fixed at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// Pop order: highest first.
    pub const DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Urgent,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }

    /// Position in [`Self::DESCENDING`].
    pub fn bucket(&self) -> usize {
        match self {
            TaskPriority::Urgent => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl core::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "1" => Ok(Self::Low),
            "normal" | "2" => Ok(Self::Normal),
            "high" | "3" => Ok(Self::High),
            "urgent" | "4" => Ok(Self::Urgent),
            other => Err(CoreError::validation(format!("unknown priority: {other}"))),
        }
    }
}

/// Task execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by a worker; handler is executing
    Processing,
    /// Failed, parked until its backoff delay elapses
    Retrying,
    /// Handler succeeded
    Completed,
    /// Exhausted retries or had no handler
    Failed,
    /// Cancelled while pending
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a worker may claim a task in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::validation(format!("unknown status: {other}"))),
        }
    }
}

/// Rejected state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {id}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry - 1)
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Linear
    }
}

impl FromStr for BackoffStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(CoreError::validation(format!("unknown backoff strategy: {other}"))),
        }
    }
}

/// Delay schedule between a failed attempt and its retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately (useful in tests).
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    /// Calculate the delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((retry - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * (retry as f64)).min(max_ms),
        };

        // Deterministic jitter derived from the retry number
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((retry as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }
}

/// Record of one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// The durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Selects the handler
    pub task_type: String,
    /// Passed verbatim to the handler
    pub payload: Payload,
    /// Requesting user; used for rate-limit scoping and listing only
    pub owner: Option<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// First time a worker claimed the task
    pub started_at: Option<DateTime<Utc>>,
    /// Time the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<Payload>,
    pub error: Option<String>,
    /// When a RETRYING task becomes eligible again
    pub retry_at: Option<DateTime<Utc>>,
    /// Previous attempts, oldest first
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl TaskRecord {
    /// Create a new pending task.
    pub fn new(
        task_type: impl Into<String>,
        payload: Payload,
        owner: Option<String>,
        priority: TaskPriority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            owner,
            priority,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            result: None,
            error: None,
            retry_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn reject(&self, to: TaskStatus) -> TransitionError {
        TransitionError {
            id: self.id,
            from: self.status,
            to,
        }
    }

    /// Whether another retry is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    fn push_attempt(
        &mut self,
        started: DateTime<Utc>,
        now: DateTime<Utc>,
        error: Option<String>,
    ) {
        self.history.push(AttemptRecord {
            attempt: self.retry_count + 1,
            started_at: started,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started).num_milliseconds().max(0) as u64,
        });
    }

    /// PENDING/RETRYING -> PROCESSING.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.is_claimable() {
            return Err(self.reject(TaskStatus::Processing));
        }
        self.status = TaskStatus::Processing;
        self.retry_at = None;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// PROCESSING -> COMPLETED.
    pub fn complete(
        &mut self,
        result: Payload,
        started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Processing {
            return Err(self.reject(TaskStatus::Completed));
        }
        self.push_attempt(started, now, None);
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// PROCESSING -> FAILED.
    pub fn fail(
        &mut self,
        error: String,
        started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Processing {
            return Err(self.reject(TaskStatus::Failed));
        }
        self.push_attempt(started, now, Some(error.clone()));
        self.status = TaskStatus::Failed;
        self.result = None;
        self.error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    /// PROCESSING -> RETRYING. The error is kept in `history` only.
    pub fn schedule_retry(
        &mut self,
        error: String,
        started: DateTime<Utc>,
        now: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Processing || !self.should_retry() {
            return Err(self.reject(TaskStatus::Retrying));
        }
        self.push_attempt(started, now, Some(error));
        self.retry_count += 1;
        self.status = TaskStatus::Retrying;
        self.error = None;
        self.retry_at = Some(retry_at);
        Ok(())
    }

    /// RETRYING -> PENDING, once the task is back in its bucket.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Retrying {
            return Err(self.reject(TaskStatus::Pending));
        }
        self.status = TaskStatus::Pending;
        self.retry_at = None;
        Ok(())
    }

    /// PENDING -> CANCELLED.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Pending {
            return Err(self.reject(TaskStatus::Cancelled));
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    fn task() -> TaskRecord {
        TaskRecord::new(
            "test",
            payload(json!({"key": "value"})),
            Some("user-1".into()),
            TaskPriority::High,
            Utc::now(),
        )
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_retry(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
    }

    #[test]
    fn default_backoff_is_linear_and_capped() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(90));
        assert_eq!(policy.delay_for_retry(50), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5));
        for retry in 1..30 {
            assert!(policy.delay_for_retry(retry) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn priority_and_status_parse() {
        assert_eq!("URGENT".parse::<TaskPriority>().unwrap(), TaskPriority::Urgent);
        assert_eq!("1".parse::<TaskPriority>().unwrap(), TaskPriority::Low);
        assert!("asap".parse::<TaskPriority>().is_err());
        assert_eq!("cancelled".parse::<TaskStatus>().unwrap(), TaskStatus::Cancelled);
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn task_lifecycle() {
        let mut task = task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);

        let started = Utc::now();
        task.claim(started).unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.started_at, Some(started));

        task.complete(payload(json!({"ok": true})), started, Utc::now()).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.result.is_some());
        assert!(task.error.is_none());
        assert!(task.completed_at.is_some());
        assert_eq!(task.history.len(), 1);
        assert!(task.history[0].success);
    }

    #[test]
    fn retry_then_fail() {
        let mut task = task().with_max_retries(1);
        let t0 = Utc::now();

        task.claim(t0).unwrap();
        task.schedule_retry("boom".into(), t0, t0, t0).unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.is_none());
        assert_eq!(task.retry_at, Some(t0));

        task.requeue().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let t1 = Utc::now();
        task.claim(t1).unwrap();
        assert_eq!(task.started_at, Some(t0), "started_at is set once");
        assert!(!task.should_retry());
        assert!(task.schedule_retry("again".into(), t1, t1, t1).is_err());

        task.fail("again".into(), t1, t1).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("again"));
        assert_eq!(task.history.len(), 2);
        assert_eq!(task.history[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn terminal_states_are_final() {
        let now = Utc::now();
        let mut task = task();
        task.cancel(now).unwrap();

        assert!(task.claim(now).is_err());
        assert!(task.cancel(now).is_err());
        assert!(task.requeue().is_err());
        let err = task.complete(Payload::new(), now, now).unwrap_err();
        assert_eq!(err.from, TaskStatus::Cancelled);
        assert_eq!(err.to, TaskStatus::Completed);
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn cancel_only_from_pending() {
        let now = Utc::now();
        let mut task = task();
        task.claim(now).unwrap();
        assert!(task.cancel(now).is_err());
        assert_eq!(task.status, TaskStatus::Processing);
    }

    #[test]
    fn record_survives_json() {
        let mut task = task();
        task.claim(Utc::now()).unwrap();
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }
}
