use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use taskflow_infra::{EngineConfig, TaskEngine};
use taskflow_queue::DEFAULT_RETENTION;

mod handlers;

/// How often finished records are purged.
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskflow_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let engine = Arc::new(TaskEngine::new(config).context("failed to build task engine")?);

    handlers::register(engine.queue());
    engine.start().context("failed to start worker pool")?;
    tracing::info!(
        handlers = ?engine.queue().handlers().task_types(),
        "taskflow worker running"
    );

    let purger = tokio::spawn(purge_loop(engine.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    purger.abort();
    // Joins the worker threads, which may be mid-handler.
    tokio::task::spawn_blocking(move || engine.close())
        .await
        .context("worker shutdown panicked")?;

    Ok(())
}

async fn purge_loop(engine: Arc<TaskEngine>) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        interval.tick().await;
        let engine = engine.clone();
        let purged = tokio::task::spawn_blocking(move || {
            engine.queue().purge_finished(DEFAULT_RETENTION)
        })
        .await;
        match purged {
            Ok(Ok(removed)) => tracing::debug!(removed, "purge finished"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to purge finished tasks"),
            Err(e) => tracing::error!(error = %e, "purge task panicked"),
        }
    }
}
