//! Process wiring: tracing, database, queue consumers and shutdown.

use std::path::Path;
use std::sync::Arc;

use manga_db::DbPool;
use manga_events::ProgressRelay;
use manga_pipeline::{
    Intake, IntakeError, JobLifecycle, JobStore, OutputCataloger, PgJobStore, TranslationHandler,
    WorkerSupervisor,
};
use manga_queue::{Dispatcher, PgTaskStore, TaskQueue, TaskStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigError, WorkerConfig};

const DEFAULT_LOG_FILTER: &str =
    "manga_worker=debug,manga_pipeline=debug,manga_queue=info,manga_events=info";

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Intake(#[from] IntakeError),
}

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Connect, check and migrate the database.
pub async fn connect(config: &WorkerConfig) -> Result<DbPool, StartupError> {
    let pool = manga_db::create_pool(&config.database_url, config.db_max_connections).await?;
    tracing::info!("Database connection pool created");

    manga_db::health_check(&pool).await?;
    tracing::info!("Database health check passed");

    manga_db::run_migrations(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}

/// Consume the queue until a shutdown signal, then drain.
pub async fn run_worker(config: &WorkerConfig, pool: DbPool) {
    let job_store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let task_store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool));
    let relay = ProgressRelay::default();

    let handler = Arc::new(TranslationHandler::new(
        JobLifecycle::new(Arc::clone(&job_store), relay.clone()),
        WorkerSupervisor::new(config.supervisor_config()),
        Arc::new(OutputCataloger::new(config.storage_layout(), job_store)),
    ));
    let dispatcher = Dispatcher::new(task_store, handler, config.dispatcher_config());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    tracing::info!(
        program = %config.worker_program,
        worker_dir = %config.worker_dir.display(),
        storage = %config.storage_path.display(),
        "Worker started",
    );
    dispatcher.run(shutdown).await;

    relay.close();
    tracing::info!("Worker stopped");
}

/// Store a local file as a new upload and enqueue it.
pub async fn submit_file(
    config: &WorkerConfig,
    pool: DbPool,
    file: &Path,
) -> Result<manga_db::models::request::Request, StartupError> {
    let contents = tokio::fs::read(file).await.map_err(|source| StartupError::Read {
        path: file.display().to_string(),
        source,
    })?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let queue = TaskQueue::new(Arc::new(PgTaskStore::new(pool.clone())))
        .with_max_attempts(config.max_attempts);
    let intake = Intake::new(Arc::new(PgJobStore::new(pool)), queue, config.storage_layout());

    Ok(intake.submit(&filename, &contents).await?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
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
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
