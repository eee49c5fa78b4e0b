use std::collections::HashMap;

use tracing::instrument;

use taskflow_queue::{StatEvent, StatsCounters, StatsStore, StoreError};

use super::{RedisBackend, store_error};

/// Counters in one hash, bumped with `HINCRBY` so every worker process
/// contributes to the same totals.
#[derive(Debug, Clone)]
pub struct RedisStatsStore {
    backend: RedisBackend,
}

impl RedisStatsStore {
    pub(crate) fn new(backend: RedisBackend) -> Self {
        Self { backend }
    }

    fn stats_key(&self) -> String {
        self.backend.key("stats")
    }
}

impl StatsStore for RedisStatsStore {
    #[instrument(skip(self), err)]
    fn record(&self, event: StatEvent) -> Result<(), StoreError> {
        let mut delta = StatsCounters::default();
        delta.apply(event);

        let key = self.stats_key();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hincr(&key, "completed", delta.completed)
            .ignore()
            .hincr(&key, "failed", delta.failed)
            .ignore()
            .hincr(&key, "retried", delta.retried)
            .ignore()
            .hincr(&key, "executions", delta.executions)
            .ignore()
            .hincr(&key, "processing_ms_total", delta.processing_ms_total)
            .ignore();

        let mut conn = self.backend.connection()?;
        let _: () = pipe.query(&mut conn).map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn counters(&self) -> Result<StatsCounters, StoreError> {
        let mut conn = self.backend.connection()?;
        let fields: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(self.stats_key())
            .query(&mut conn)
            .map_err(store_error)?;

        let field = |name: &str| fields.get(name).copied().unwrap_or_default();
        Ok(StatsCounters {
            completed: field("completed"),
            failed: field("failed"),
            retried: field("retried"),
            executions: field("executions"),
            processing_ms_total: field("processing_ms_total"),
        })
    }
}
