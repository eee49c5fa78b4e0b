//! Task handlers and their registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use taskflow_core::Payload;

use crate::types::TaskRecord;

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Task completed with a result payload
    Success(Payload),
    /// Task failed; retried while retries remain
    Failure(String),
}

impl HandlerOutcome {
    pub fn success(result: Payload) -> Self {
        Self::Success(result)
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure(error.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl<E: core::fmt::Display> From<Result<Payload, E>> for HandlerOutcome {
    fn from(result: Result<Payload, E>) -> Self {
        match result {
            Ok(payload) => Self::Success(payload),
            Err(e) => Self::Failure(e.to_string()),
        }
    }
}

/// The work behind one task type.
///
/// Handlers run synchronously on a worker unit; long I/O blocks only that unit.
pub trait TaskHandler: Send + Sync {
    fn execute(&self, task: &TaskRecord) -> HandlerOutcome;
}

impl<F> TaskHandler for F
where
    F: Fn(&TaskRecord) -> HandlerOutcome + Send + Sync,
{
    fn execute(&self, task: &TaskRecord) -> HandlerOutcome {
        self(task)
    }
}

/// A handler plus the rate-limit scope its tasks are admitted under.
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn TaskHandler>,
    pub rate_limit_scope: Option<String>,
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("rate_limit_scope", &self.rate_limit_scope)
            .finish_non_exhaustive()
    }
}

/// `task_type -> handler` table, shared by the facade and every worker.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `task_type`.
    pub fn register<H>(&self, task_type: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.insert(task_type.into(), Arc::new(handler), None);
    }

    /// Register a handler whose tasks must pass `scope` of the rate-limit
    /// policy (keyed by the task owner) before they are claimed.
    pub fn register_rate_limited<H>(
        &self,
        task_type: impl Into<String>,
        scope: impl Into<String>,
        handler: H,
    ) where
        H: TaskHandler + 'static,
    {
        self.insert(task_type.into(), Arc::new(handler), Some(scope.into()));
    }

    fn insert(&self, task_type: String, handler: Arc<dyn TaskHandler>, scope: Option<String>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        tracing::info!(task_type = %task_type, rate_limit_scope = ?scope, "registered task handler");
        handlers.insert(
            task_type,
            Registration {
                handler,
                rate_limit_scope: scope,
            },
        );
    }

    pub fn resolve(&self, task_type: &str) -> Option<Registration> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_type)
            .cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskPriority;
    use chrono::Utc;

    fn task(task_type: &str) -> TaskRecord {
        TaskRecord::new(task_type, Payload::new(), None, TaskPriority::Normal, Utc::now())
    }

    #[test]
    fn closures_are_handlers() {
        let registry = HandlerRegistry::new();
        registry.register("echo", |task: &TaskRecord| HandlerOutcome::success(task.payload.clone()));

        let registration = registry.resolve("echo").unwrap();
        assert!(registration.rate_limit_scope.is_none());
        assert!(registration.handler.execute(&task("echo")).is_success());
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn rate_limited_registration_keeps_scope() {
        let registry = HandlerRegistry::new();
        registry.register_rate_limited("generate", "api_generation", |_: &TaskRecord| {
            HandlerOutcome::failure("provider down")
        });

        let registration = registry.resolve("generate").unwrap();
        assert_eq!(registration.rate_limit_scope.as_deref(), Some("api_generation"));
        assert_eq!(
            registration.handler.execute(&task("generate")),
            HandlerOutcome::Failure("provider down".into())
        );
        assert_eq!(registry.task_types(), vec!["generate".to_string()]);
    }

    #[test]
    fn results_convert_into_outcomes() {
        let ok: Result<Payload, String> = Ok(Payload::new());
        let err: Result<Payload, String> = Err("nope".into());
        assert!(HandlerOutcome::from(ok).is_success());
        assert_eq!(HandlerOutcome::from(err), HandlerOutcome::Failure("nope".into()));
    }
}
