//! Engine configuration, loaded once from the environment.

use core::str::FromStr;
use std::time::Duration;

use taskflow_queue::{BackoffPolicy, BackoffStrategy, QueueConfig, WorkerPoolConfig};
use taskflow_ratelimit::Quota;
use taskflow_ratelimit::policy::default_rules;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";
pub const DEFAULT_KEY_PREFIX: &str = "taskflow";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Where tasks, queues and counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Per-process; lost on restart
    #[default]
    Memory,
    /// Shared Redis instance; survives restarts, supports many workers
    Redis,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" | "in-memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("expected memory or redis, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendKind,
    pub redis_url: String,
    /// Namespace for every shared-store key
    pub key_prefix: String,
    pub queue: QueueConfig,
    /// Quota overrides by scope name
    pub rate_limits: Vec<(String, Quota)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            queue: QueueConfig::default(),
            rate_limits: Vec::new(),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(var, &raw, e)),
        _ => Ok(None),
    }
}

impl EngineConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(backend) = parse(&lookup, "TASKFLOW_BACKEND")? {
            config.backend = backend;
        }
        if let Some(url) = parse::<String>(&lookup, "REDIS_URL")? {
            config.redis_url = url;
        }
        if let Some(prefix) = parse::<String>(&lookup, "TASKFLOW_KEY_PREFIX")? {
            config.key_prefix = prefix;
        }

        let mut pool = WorkerPoolConfig::default();
        if let Some(units) = parse::<usize>(&lookup, "WORKER_COUNT")? {
            if units == 0 {
                return Err(ConfigError::invalid("WORKER_COUNT", "0", "must be at least 1"));
            }
            pool = pool.with_units(units);
        }
        if let Some(ms) = parse::<u64>(&lookup, "WORKER_POLL_INTERVAL_MS")? {
            pool = pool.with_poll_interval(Duration::from_millis(ms));
        }
        config.queue.pool = pool;

        if let Some(retries) = parse::<u32>(&lookup, "TASK_MAX_RETRIES")? {
            config.queue.default_max_retries = retries;
        }

        let mut backoff = BackoffPolicy::default();
        if let Some(strategy) = parse::<BackoffStrategy>(&lookup, "RETRY_BACKOFF")? {
            backoff.strategy = strategy;
        }
        if let Some(ms) = parse::<u64>(&lookup, "RETRY_BASE_DELAY_MS")? {
            backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "RETRY_MAX_DELAY_MS")? {
            backoff.max_delay = Duration::from_millis(ms);
        }
        if backoff.max_delay < backoff.base_delay {
            return Err(ConfigError::invalid(
                "RETRY_MAX_DELAY_MS",
                &backoff.max_delay.as_millis().to_string(),
                "must not be below RETRY_BASE_DELAY_MS",
            ));
        }
        config.queue.backoff = backoff;

        for rule in default_rules() {
            let var = format!("RATE_LIMIT_{}", rule.name.to_ascii_uppercase());
            if let Some(quota) = parse::<Quota>(&lookup, &var)? {
                config.rate_limits.push((rule.name, quota));
            }
        }

        Ok(config)
    }
}
