//! Fixed-window rate limiting with composable scopes.
//!
//! ## Design
//!
//! - The current time maps to a window index (`floor(now / window)`)
//! - A counter keyed by `(identifier, window, index)` is compared to the quota
//! - Only [`RateLimiter::check`] increments; inspection and reset never do
//! - [`RateLimitPolicy`] checks several scopes together and names the binding one
//!
//! Fixed windows allow a burst of up to twice the limit across a window
//! boundary. That is accepted behavior, not a bug.
//!
//! ## Components
//!
//! - `CounterStore`: atomic compare-and-increment storage (in-memory here,
//!   Redis in `taskflow-infra`)
//! - `RateLimiter`: window arithmetic over a counter store
//! - `RateLimitPolicy`: named scopes (global, per-user, per-ip, per-operation)

pub mod decision;
pub mod error;
pub mod limiter;
pub mod policy;
pub mod quota;
pub mod store;

pub use decision::RateLimitDecision;
pub use error::RateLimitError;
pub use limiter::RateLimiter;
pub use policy::{PolicyDecision, RateLimitPolicy, Scope, ScopeDecision, ScopeRule, Subject};
pub use quota::Quota;
pub use store::{Acquire, CounterStore, InMemoryCounterStore};
