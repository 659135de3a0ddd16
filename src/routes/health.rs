//! Health check endpoints for Kubernetes probes and monitoring.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::AppState;
#[cfg(feature = "prometheus")]
use crate::observability::metrics::get_prometheus_handle;

/// Detailed health status response.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// "healthy" or "unhealthy"
    pub status: String,
    pub version: String,
    pub subsystems: SubsystemStatus,
}

/// Status of individual subsystems.
#[derive(Debug, Serialize)]
pub struct SubsystemStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentStatus>,
    pub blob_store: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<ComponentStatus>,
}

/// Status of a single component.
#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<&'static str>,
    pub latency_ms: u64,
}

impl ComponentStatus {
    fn from_check<E: std::fmt::Display>(
        result: Result<(), E>,
        start: std::time::Instant,
        backend: Option<&'static str>,
    ) -> Self {
        let latency_ms = start.elapsed().as_millis() as u64;
        Self {
            healthy: result.is_ok(),
            message: result.err().map(|e| e.to_string()),
            backend,
            latency_ms,
        }
    }
}

/// Full health check with subsystem status.
///
/// Every subsystem the cleanup run depends on must be reachable for the
/// service to report healthy.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.db {
        Some(db) => {
            let start = std::time::Instant::now();
            let result = db.health_check().await;
            Some(ComponentStatus::from_check(
                result,
                start,
                Some(db.backend_name()),
            ))
        }
        None => None,
    };

    let start = std::time::Instant::now();
    let result = state.blob_store.health_check().await;
    let blob_store =
        ComponentStatus::from_check(result, start, Some(state.blob_store.backend_name()));

    let secrets = match &state.secrets {
        Some(secrets) => {
            let start = std::time::Instant::now();
            let result = secrets.health_check().await;
            Some(ComponentStatus::from_check(result, start, None))
        }
        None => None,
    };

    let overall_healthy = blob_store.healthy
        && database.as_ref().is_none_or(|c| c.healthy)
        && secrets.as_ref().is_none_or(|c| c.healthy);

    let health = HealthStatus {
        status: if overall_healthy {
            "healthy"
        } else {
            "unhealthy"
        }
        .to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        subsystems: SubsystemStatus {
            database,
            blob_store,
            secrets,
        },
    };

    let status_code = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Kubernetes liveness probe. Always 200 while the process serves requests.
#[tracing::instrument(name = "health.liveness")]
pub async fn liveness() -> impl IntoResponse {
    StatusCode::OK
}

/// Kubernetes readiness probe.
///
/// Ready when the database and blob store both answer, since a cleanup
/// triggered without either would fail immediately.
#[tracing::instrument(name = "health.readiness", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(db) = &state.db
        && db.health_check().await.is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    if state.blob_store.health_check().await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    StatusCode::OK
}

/// Prometheus metrics endpoint.
#[tracing::instrument(name = "health.metrics")]
pub async fn metrics() -> impl IntoResponse {
    #[cfg(feature = "prometheus")]
    {
        return match get_prometheus_handle() {
            Some(handle) => (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            ),
            None => (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            ),
        };
    }
    #[cfg(not(feature = "prometheus"))]
    (
        StatusCode::NOT_FOUND,
        [("content-type", "text/plain")],
        "Prometheus metrics not enabled".to_string(),
    )
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use std::sync::Arc;

    use axum::{Router, body::Body};
    use http::Request;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::CleanupConfig,
        services::{BlobStore, MemoryBlobStore},
    };

    /// Build the app against a shared in-memory SQLite database and a
    /// filesystem blob root. The returned directory must outlive the app.
    async fn test_app() -> (Router, TempDir) {
        use std::sync::atomic::{AtomicU64, Ordering};

        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let db_id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let blobs = TempDir::new().unwrap();

        let config_str = format!(
            r#"
[database]
type = "sqlite"
path = "file:test_health_db_{}?mode=memory&cache=shared"
wal_mode = false

[storage.filesystem]
path = "{}"

[retention.windows]
exposure = 30
"#,
            db_id,
            blobs.path().display()
        );

        let config = CleanupConfig::from_str(&config_str).expect("Failed to parse test config");
        let state = crate::AppState::new(config.clone(), None)
            .await
            .expect("Failed to create AppState");
        (crate::build_app(&config, state), blobs)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_check_reports_subsystems() {
        let (app, _blobs) = test_app().await;

        let (status, body) = get(&app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["version"].as_str().unwrap().contains('.'));
        assert_eq!(body["subsystems"]["database"]["healthy"], true);
        assert_eq!(body["subsystems"]["database"]["backend"], "sqlite");
        assert_eq!(body["subsystems"]["blob_store"]["healthy"], true);
        assert_eq!(body["subsystems"]["blob_store"]["backend"], "filesystem");
        assert!(body["subsystems"]["secrets"].is_null());
    }

    #[tokio::test]
    async fn test_missing_blob_root_is_unhealthy() {
        let (app, blobs) = test_app().await;
        drop(blobs);

        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["subsystems"]["blob_store"]["healthy"], false);
        assert!(body["subsystems"]["blob_store"]["message"].is_string());

        let (status, _) = get(&app, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = get(&app, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_liveness_and_readiness() {
        let (app, _blobs) = test_app().await;

        let (status, _) = get(&app, "/health/live").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(&app, "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unavailable_memory_store_fails_readiness() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let config = CleanupConfig::from_str(
            r#"
            [retention.windows]
            exposure = 30
        "#,
        )
        .unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.set_unavailable(true);
        let blob_store: Arc<dyn BlobStore> = store;

        let pool = crate::db::tests::harness::create_sqlite_pool().await;
        crate::db::tests::harness::run_sqlite_migrations(&pool).await;
        let db = Arc::new(crate::db::DbPool::from_sqlite(pool));
        let orchestrator = Arc::new(
            crate::retention::RetentionOrchestrator::from_config(
                &config.retention,
                db.exposures(),
                blob_store.clone(),
            )
            .unwrap(),
        );
        let state = crate::AppState {
            config: Arc::new(config.clone()),
            db: Some(db),
            blob_store,
            secrets: None,
            orchestrator,
            task_tracker: tokio_util::task::TaskTracker::new(),
        };
        let app = crate::build_app(&config, state);

        let (status, _) = get(&app, "/health/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
