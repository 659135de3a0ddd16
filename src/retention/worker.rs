//! In-process cleanup schedule.
//!
//! The normal trigger is an external scheduler calling the HTTP endpoint. When
//! `[retention.schedule]` is enabled the service also runs cleanup on its own,
//! once at startup and then `interval_secs` after each run finishes.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::CleanupOrchestrator;
use crate::config::RetentionConfig;

/// Runs cleanup on the configured interval until `shutdown` is cancelled.
///
/// A run in progress is allowed to finish; cancellation is only observed
/// between runs.
pub async fn start_cleanup_worker(
    orchestrator: Arc<dyn CleanupOrchestrator>,
    config: RetentionConfig,
    shutdown: CancellationToken,
) {
    if !config.schedule.enabled {
        tracing::info!("Scheduled cleanup disabled by configuration");
        return;
    }

    let dry_run_msg = if config.dry_run { " (DRY RUN)" } else { "" };
    tracing::info!(
        interval_secs = config.schedule.interval_secs,
        timeout_secs = config.timeout_secs,
        dry_run = config.dry_run,
        "Starting scheduled cleanup worker{}",
        dry_run_msg
    );

    run_schedule(
        orchestrator,
        config.timeout(),
        config.schedule.interval(),
        shutdown,
    )
    .await;

    tracing::info!("Scheduled cleanup worker stopped");
}

async fn run_schedule(
    orchestrator: Arc<dyn CleanupOrchestrator>,
    timeout: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let outcome = orchestrator.run(deadline).await;
        if outcome.is_failure() {
            tracing::warn!(
                state = outcome.state.as_str(),
                "Scheduled cleanup run did not complete cleanly; retrying next interval"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }
}
