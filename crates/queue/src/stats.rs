//! Processing statistics.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::priority_queue::QueueDepths;
use crate::store::StoreError;
use crate::worker::PoolInfo;

/// Something worth counting happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatEvent {
    /// Handler succeeded after running for `elapsed`.
    Completed { elapsed: Duration },
    /// Task reached FAILED; `elapsed` is `None` when no handler ran.
    Failed { elapsed: Option<Duration> },
    /// Handler failed and the task was parked for retry.
    Retried { elapsed: Duration },
}

/// Raw cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsCounters {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    /// Handler invocations that were timed
    pub executions: u64,
    pub processing_ms_total: u64,
}

impl StatsCounters {
    pub fn apply(&mut self, event: StatEvent) {
        let elapsed = match event {
            StatEvent::Completed { elapsed } => {
                self.completed += 1;
                Some(elapsed)
            }
            StatEvent::Failed { elapsed } => {
                self.failed += 1;
                elapsed
            }
            StatEvent::Retried { elapsed } => {
                self.retried += 1;
                Some(elapsed)
            }
        };
        if let Some(elapsed) = elapsed {
            self.executions += 1;
            self.processing_ms_total += elapsed.as_millis() as u64;
        }
    }

    /// Tasks that reached COMPLETED or FAILED.
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn average_processing_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.processing_ms_total as f64 / self.executions as f64
        }
    }
}

/// Counter storage shared by every worker.
pub trait StatsStore: Send + Sync {
    fn record(&self, event: StatEvent) -> Result<(), StoreError>;

    fn counters(&self) -> Result<StatsCounters, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStatsStore {
    counters: Mutex<StatsCounters>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsStore for InMemoryStatsStore {
    fn record(&self, event: StatEvent) -> Result<(), StoreError> {
        self.counters
            .lock()
            .map_err(|_| StoreError::Storage("stats lock poisoned".to_string()))?
            .apply(event);
        Ok(())
    }

    fn counters(&self) -> Result<StatsCounters, StoreError> {
        self.counters
            .lock()
            .map(|c| *c)
            .map_err(|_| StoreError::Storage("stats lock poisoned".to_string()))
    }
}

/// Aggregate view returned by `QueueManager::get_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub backend: &'static str,
    pub queue_depths: QueueDepths,
    pub scheduled_retries: usize,
    pub total_processed: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub average_processing_ms: f64,
    /// Present while this process runs a worker pool.
    pub workers: Option<PoolInfo>,
}

impl QueueStats {
    pub fn new(
        backend: &'static str,
        queue_depths: QueueDepths,
        scheduled_retries: usize,
        counters: StatsCounters,
        workers: Option<PoolInfo>,
    ) -> Self {
        Self {
            backend,
            queue_depths,
            scheduled_retries,
            total_processed: counters.processed(),
            total_completed: counters.completed,
            total_failed: counters.failed,
            total_retried: counters.retried,
            average_processing_ms: counters.average_processing_ms(),
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_outcomes_and_average() {
        let store = InMemoryStatsStore::new();
        store
            .record(StatEvent::Completed { elapsed: Duration::from_millis(30) })
            .unwrap();
        store
            .record(StatEvent::Retried { elapsed: Duration::from_millis(10) })
            .unwrap();
        store.record(StatEvent::Failed { elapsed: None }).unwrap();

        let counters = store.counters().unwrap();
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.retried, 1);
        assert_eq!(counters.processed(), 2);
        assert_eq!(counters.executions, 2);
        assert_eq!(counters.average_processing_ms(), 20.0);
    }

    #[test]
    fn empty_average_is_zero() {
        assert_eq!(StatsCounters::default().average_processing_ms(), 0.0);
    }
}
