//! Cleanup trigger endpoint, called by the external scheduler.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde_json::json;

use crate::AppState;

/// Run one cleanup and report the aggregate outcome.
///
/// The run is spawned onto the task tracker so it finishes even if the caller
/// disconnects, and so graceful shutdown waits for it. The response carries
/// counts only:
///
/// - `200` for a completed run, or one stopped cleanly by the deadline
/// - `500` for a failed run, or one stopped by the deadline after errors
#[tracing::instrument(name = "cleanup.trigger", skip(state))]
pub async fn trigger_cleanup(State(state): State<AppState>) -> impl IntoResponse {
    let deadline = tokio::time::Instant::now() + state.config.retention.timeout();
    let orchestrator = state.orchestrator.clone();

    match state
        .task_tracker
        .spawn(async move { orchestrator.run(deadline).await })
        .await
    {
        Ok(outcome) => (outcome.http_status(), Json(json!(outcome.summary()))),
        Err(e) => {
            tracing::error!(error = %e, "Cleanup run task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "failure", "state": "failed" })),
            )
        }
    }
}
