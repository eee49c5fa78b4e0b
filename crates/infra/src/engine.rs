//! `TaskEngine`: an explicitly constructed queue + rate-limit service.

use std::sync::Arc;

use tracing::info;

use taskflow_core::{SharedClock, SystemClock};
use taskflow_queue::{QueueBackends, QueueError, QueueManager, StoreError};
use taskflow_ratelimit::{CounterStore, InMemoryCounterStore, RateLimitError, RateLimitPolicy, RateLimiter};

use crate::config::{BackendKind, ConfigError, EngineConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("backend {0:?} requires the `redis` feature")]
    BackendDisabled(BackendKind),
}

/// Queue manager and rate-limit policy over one backend.
///
/// Built once at startup with [`TaskEngine::new`] and handed to whoever needs
/// it; [`TaskEngine::close`] stops the worker pool.
#[derive(Debug)]
pub struct TaskEngine {
    config: EngineConfig,
    queue: Arc<QueueManager>,
    rate_limits: Arc<RateLimitPolicy>,
}

impl TaskEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: EngineConfig, clock: SharedClock) -> Result<Self, EngineError> {
        let (backends, counters) = build_backends(&config)?;

        let limiter = RateLimiter::new(counters, clock.clone())
            .with_prefix(format!("{}:rate_limit", config.key_prefix));
        let mut rate_limits = RateLimitPolicy::with_defaults(limiter);
        for (scope, quota) in &config.rate_limits {
            rate_limits.set_quota(scope, *quota)?;
        }

        let queue = QueueManager::new(backends, config.queue.clone(), clock);

        info!(
            backend = ?config.backend,
            key_prefix = %config.key_prefix,
            units = config.queue.pool.units,
            "task engine ready"
        );

        Ok(Self {
            config,
            queue: Arc::new(queue),
            rate_limits: Arc::new(rate_limits),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitPolicy> {
        &self.rate_limits
    }

    /// Spawn the worker pool; rate-limited handlers are gated by this
    /// engine's policy.
    pub fn start(&self) -> Result<(), EngineError> {
        self.queue.start_workers(Some(self.rate_limits.clone()))?;
        Ok(())
    }

    /// Stop the worker pool after in-flight handlers finish. Idempotent.
    pub fn close(&self) {
        self.queue.close();
        info!("task engine closed");
    }
}

fn build_backends(config: &EngineConfig) -> Result<(QueueBackends, Arc<dyn CounterStore>), EngineError> {
    match config.backend {
        BackendKind::Memory => Ok((
            QueueBackends::in_memory(),
            Arc::new(InMemoryCounterStore::new()),
        )),
        #[cfg(feature = "redis")]
        BackendKind::Redis => {
            let redis = crate::redis_store::RedisBackend::connect(&config.redis_url, &config.key_prefix)?;
            redis.ping()?;
            Ok((redis.queue_backends(), Arc::new(redis.counter_store())))
        }
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => Err(EngineError::BackendDisabled(BackendKind::Redis)),
    }
}
