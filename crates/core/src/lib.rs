//! `taskflow-core` — shared building blocks for the task engine.
//!
//! Identifiers, the opaque payload type and the clock abstraction live here so
//! the queue and rate-limit crates can agree on them without depending on each
//! other.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::CoreError;
pub use id::TaskId;

/// Opaque key-value structure handed verbatim to task handlers.
pub type Payload = serde_json::Map<String, serde_json::Value>;
