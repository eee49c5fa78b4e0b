//! Infrastructure layer: configuration, shared-store backends and the
//! engine service object that wires them together.

pub mod config;
pub mod engine;

/// Redis implementations of the queue, stats and rate-limit stores.
#[cfg(feature = "redis")]
pub mod redis_store;

pub use config::{BackendKind, ConfigError, EngineConfig};
pub use engine::{EngineError, TaskEngine};
