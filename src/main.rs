use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{Router, routing::get};
use clap::Parser;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

mod config;
mod db;
mod models;
pub mod observability;
mod retention;
mod routes;
mod secrets;
pub mod services;

use retention::{CleanupOrchestrator, RetentionOrchestrator};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::CleanupConfig>,
    pub db: Option<Arc<db::DbPool>>,
    pub blob_store: Arc<dyn services::BlobStore>,
    pub secrets: Option<Arc<dyn secrets::SecretManager>>,
    pub orchestrator: Arc<dyn CleanupOrchestrator>,
    /// Tracks cleanup runs started by the trigger endpoint and the schedule.
    /// Graceful shutdown waits for them.
    pub task_tracker: TaskTracker,
}

impl AppState {
    /// Connect to the database and blob store and build the orchestrator.
    ///
    /// Secret references in `config` must already be resolved.
    pub async fn new(
        config: config::CleanupConfig,
        secrets: Option<Arc<dyn secrets::SecretManager>>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if config.database.is_none() {
            return Err("a [database] section is required".into());
        }

        let pool = db::DbPool::from_config(&config.database).await?;
        if config.database.run_migrations() {
            pool.run_migrations().await?;
        }
        let db = Arc::new(pool);
        tracing::info!(backend = db.backend_name(), "Database connected");

        let blob_store = services::create_blob_store(&config.storage).await?;
        tracing::info!(backend = blob_store.backend_name(), "Blob store initialized");

        let orchestrator: Arc<dyn CleanupOrchestrator> = Arc::new(
            RetentionOrchestrator::from_config(&config.retention, db.exposures(), blob_store.clone())?,
        );

        Ok(Self {
            config: Arc::new(config),
            db: Some(db),
            blob_store,
            secrets,
            orchestrator,
            task_tracker: TaskTracker::new(),
        })
    }
}

pub fn build_app(config: &config::CleanupConfig, state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/health/live", get(routes::health::liveness))
        .route("/health/ready", get(routes::health::readiness))
        .route(
            &config.server.trigger_path,
            get(routes::cleanup::trigger_cleanup).post(routes::cleanup::trigger_cleanup),
        );

    if config.observability.metrics.serves_prometheus() {
        app = app.route(
            &config.observability.metrics.path,
            get(routes::health::metrics),
        );
    }

    // Layers run outermost-last: the request ID is assigned before tracing sees the request.
    app.layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// CLI arguments for the exposure cleanup service
#[derive(Parser, Debug)]
#[command(version, about = "Exposure record retention cleanup", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file
    #[arg(short, long, global = true, default_value = "exposure-cleanup.toml")]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default)
    Serve,
    /// Execute one cleanup run, print the outcome as JSON and exit
    ///
    /// Exits non-zero when the run failed or stopped at the deadline after errors.
    Run,
    /// Run database migrations and exit
    ///
    /// Useful for Kubernetes init containers or CI/CD pipelines.
    Migrate,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Migrate) => run_migrate(&args.config).await,
        Some(Command::Run) => run_once(&args.config).await,
        Some(Command::Serve) | None => run_server(&args.config).await,
    }
}

fn load_config(config_path: &Path) -> config::CleanupConfig {
    match config::CleanupConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    }
}

/// Load config, install logging and metrics, resolve secret references and
/// connect every backend. Any failure exits the process.
async fn bootstrap(config_path: &Path) -> AppState {
    let mut config = load_config(config_path);

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    tracing::info!(
        config_file = %config_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting exposure cleanup"
    );

    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let secrets = match secrets::create_secret_manager(&config.secrets).await {
        Ok(secrets) => secrets,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize secrets manager");
            eprintln!("Error: Failed to initialize secrets manager: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(manager) = &secrets
        && let Err(e) = config.resolve_secret_refs(manager.as_ref()).await
    {
        tracing::error!(error = %e, "Failed to resolve secret references");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    match AppState::new(config, secrets).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize application state");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_server(config_path: &Path) {
    let state = bootstrap(config_path).await;
    let config = state.config.clone();
    let db = state.db.clone();
    let task_tracker = state.task_tracker.clone();

    let shutdown = CancellationToken::new();
    task_tracker.spawn(retention::start_cleanup_worker(
        state.orchestrator.clone(),
        config.retention.clone(),
        shutdown.clone(),
    ));

    let app = build_app(&config, state);

    let bind_addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "Failed to bind");
            eprintln!("Error: Failed to bind to {}: {}", bind_addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        trigger_path = %config.server.trigger_path,
        "Server listening on http://{}",
        bind_addr
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(task_tracker, shutdown))
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    if let Some(db) = db {
        db.close().await;
    }
}

/// Wait for SIGINT/SIGTERM, stop the schedule, then wait for in-flight runs.
async fn shutdown_signal(task_tracker: TaskTracker, shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, waiting for cleanup runs to complete...");

    shutdown.cancel();
    task_tracker.close();

    let wait_result =
        tokio::time::timeout(std::time::Duration::from_secs(30), task_tracker.wait()).await;

    match wait_result {
        Ok(()) => tracing::info!("All cleanup runs completed"),
        Err(_) => {
            tracing::warn!("Timeout waiting for cleanup runs, some may not have completed")
        }
    }

    tracing::info!("Shutdown complete");
}

/// Execute a single cleanup run and exit with its status.
async fn run_once(config_path: &Path) {
    let state = bootstrap(config_path).await;

    let deadline = tokio::time::Instant::now() + state.config.retention.timeout();
    let outcome = state.orchestrator.run(deadline).await;

    match serde_json::to_string_pretty(&outcome.summary()) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!(error = %e, "Failed to serialize cleanup summary"),
    }

    if let Some(db) = &state.db {
        db.close().await;
    }

    if outcome.http_status().is_server_error() {
        std::process::exit(1);
    }
}

async fn run_migrate(config_path: &Path) {
    let config = load_config(config_path);

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    tracing::info!(
        config_file = %config_path.display(),
        "Running database migrations"
    );

    if config.database.is_none() {
        eprintln!("Error: Database is not configured. Nothing to migrate.");
        std::process::exit(1);
    }

    let mut database = config.database.clone();
    if !config.secret_ref_fields().is_empty() {
        let mut resolved = config.clone();
        match secrets::create_secret_manager(&config.secrets).await {
            Ok(Some(manager)) => {
                if let Err(e) = resolved.resolve_secret_refs(manager.as_ref()).await {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
            Ok(None) => {}
            Err(e) => {
                eprintln!("Error: Failed to initialize secrets manager: {}", e);
                std::process::exit(1);
            }
        }
        database = resolved.database;
    }

    match db::DbPool::from_config(&database).await {
        Ok(pool) => match pool.run_migrations().await {
            Ok(()) => {
                tracing::info!("Database migrations completed successfully");
                pool.close().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Database migrations failed");
                eprintln!("Error: Database migrations failed: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            eprintln!("Error: Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_state_requires_database() {
        let config = config::CleanupConfig::from_str(
            r#"
            [retention.windows]
            exposure = 30
        "#,
        )
        .unwrap();

        let err = AppState::new(config, None).await.err().unwrap();
        assert!(err.to_string().contains("[database]"));
    }

    #[test]
    fn test_cli_defaults_to_serve() {
        let args = Args::try_parse_from(["exposure-cleanup"]).unwrap();
        assert!(args.command.is_none());
        assert_eq!(args.config, PathBuf::from("exposure-cleanup.toml"));
    }

    #[test]
    fn test_cli_config_is_global() {
        let args =
            Args::try_parse_from(["exposure-cleanup", "run", "--config", "/etc/cleanup.toml"])
                .unwrap();
        assert!(matches!(args.command, Some(Command::Run)));
        assert_eq!(args.config, PathBuf::from("/etc/cleanup.toml"));
    }
}
