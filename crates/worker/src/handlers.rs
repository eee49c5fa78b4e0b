//! Built-in task handlers.

use std::time::Duration;

use serde_json::json;
use taskflow_queue::{HandlerOutcome, Payload, QueueManager, TaskRecord};

/// Upper bound for the `delay` handler.
const MAX_DELAY: Duration = Duration::from_secs(60);

pub fn register(queue: &QueueManager) {
    queue.register_handler("echo", echo);
    queue.register_handler("delay", delay);
}

/// Returns the payload unchanged.
fn echo(task: &TaskRecord) -> HandlerOutcome {
    HandlerOutcome::success(task.payload.clone())
}

/// Sleeps for `duration_ms` (capped at one minute).
fn delay(task: &TaskRecord) -> HandlerOutcome {
    let Some(ms) = task.payload.get("duration_ms").and_then(|v| v.as_u64()) else {
        return HandlerOutcome::failure("payload.duration_ms must be a non-negative integer");
    };
    let slept = Duration::from_millis(ms).min(MAX_DELAY);
    std::thread::sleep(slept);

    let mut result = Payload::new();
    result.insert("slept_ms".to_string(), json!(slept.as_millis() as u64));
    HandlerOutcome::success(result)
}
