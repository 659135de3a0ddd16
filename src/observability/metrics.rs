//! Cleanup run metrics.
//!
//! Two exporters are supported:
//! - **Prometheus**: counters and a duration histogram behind a scrape
//!   endpoint (requires the `prometheus` feature)
//! - **Logs**: one structured event per run on the `metrics` target, for
//!   pipelines that derive metrics from logs

use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{
    config::{MetricsConfig, MetricsExporter},
    retention::CleanupOutcome,
};

/// Exporter selected at startup. Unset means metrics are disabled.
static EXPORTER: OnceLock<MetricsExporter> = OnceLock::new();

/// Global Prometheus handle for the metrics endpoint.
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the metrics system with the given configuration.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    if config.exporter == MetricsExporter::Prometheus {
        install_prometheus(config)?;
    }

    EXPORTER
        .set(config.exporter)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))
}

#[cfg(feature = "prometheus")]
fn install_prometheus(config: &MetricsConfig) -> Result<(), MetricsError> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &config.duration_buckets_secs,
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?;

    let handle = builder.install_recorder().map_err(MetricsError::Install)?;

    // Store handle for the metrics endpoint
    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("Metrics already initialized".to_string()))
}

#[cfg(not(feature = "prometheus"))]
fn install_prometheus(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Err(MetricsError::Setup(
        "Prometheus exporter requires the 'prometheus' feature. \
            Rebuild with: cargo build --features prometheus, or set exporter = \"logs\""
            .to_string(),
    ))
}

/// Get the Prometheus handle for rendering metrics.
#[cfg(feature = "prometheus")]
pub fn get_prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record the result of a cleanup run.
///
/// Tracks records examined and deleted, blobs deleted and failed, run
/// duration and terminal state, enabling:
/// - Alerting on failed runs or repeated blob failures
/// - Detecting a growing backlog (runs ending in `deadline_exceeded`)
pub fn record_cleanup_run(outcome: &CleanupOutcome) {
    match EXPORTER.get() {
        Some(MetricsExporter::Logs) => log_cleanup_run(outcome),
        Some(MetricsExporter::Prometheus) => prometheus_cleanup_run(outcome),
        None => {}
    }
}

fn log_cleanup_run(outcome: &CleanupOutcome) {
    tracing::info!(
        target: "metrics",
        metric = "cleanup_run",
        state = outcome.state.as_str(),
        dry_run = outcome.dry_run,
        records_examined = outcome.records_examined,
        records_eligible = outcome.records_eligible,
        records_deleted = outcome.records_deleted,
        records_retained = outcome.records_retained,
        blobs_deleted = outcome.blobs_deleted,
        blob_failures = outcome.blob_failures,
        errors = outcome.errors.len(),
        duration_secs = outcome.duration.as_secs_f64(),
    );
}

fn prometheus_cleanup_run(outcome: &CleanupOutcome) {
    #[cfg(feature = "prometheus")]
    {
        let state = outcome.state.as_str();

        counter!("cleanup_runs_total", "state" => state, "dry_run" => outcome.dry_run.to_string())
            .increment(1);
        counter!("cleanup_records_examined_total").increment(outcome.records_examined);
        counter!("cleanup_records_deleted_total").increment(outcome.records_deleted);
        counter!("cleanup_records_retained_total").increment(outcome.records_retained);
        counter!("cleanup_blobs_deleted_total").increment(outcome.blobs_deleted);
        counter!("cleanup_blob_failures_total").increment(outcome.blob_failures);

        for error in &outcome.errors {
            counter!("cleanup_errors_total", "kind" => error.kind()).increment(1);
        }

        histogram!("cleanup_run_duration_seconds", "state" => state)
            .record(outcome.duration.as_secs_f64());

        if !outcome.is_failure() {
            gauge!("cleanup_last_success_timestamp_seconds")
                .set(chrono::Utc::now().timestamp() as f64);
        }
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}
