use std::sync::Arc;

use anyhow::{Context, Result};
use metastore::{DocumentStore, FileBackedStore, MetadataRepository};
use modelops::{FsDatasetStorage, ProcessBackend};
use orchestrator::worker_loop::{requeue_unfinished, worker_id};
use orchestrator::{
    run_worker_loop, AppConfig, InMemoryQueue, JobExecutor, JobQueue, PgQueue, PgStore,
    WorkerOptions,
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;
    let wid = worker_id();

    let (store, queue): (Arc<dyn DocumentStore>, Arc<dyn JobQueue>) = match &cfg.database_url {
        Some(url) => {
            let pg_pool = PgPool::connect(url)
                .await
                .context("Failed to connect to Postgres")?;

            sqlx::migrate!("./migrations")
                .run(&pg_pool)
                .await
                .context("Failed to run migrations")?;

            check_postgres(&pg_pool).await?;
            info!("postgres: ok");

            let store: Arc<dyn DocumentStore> = Arc::new(PgStore::new(pg_pool.clone()));
            let queue: Arc<dyn JobQueue> =
                Arc::new(PgQueue::new(pg_pool, wid.clone(), cfg.lease_secs));
            (store, queue)
        }
        None => {
            if let Some(parent) = cfg.metastore_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let store = FileBackedStore::open(&cfg.metastore_path)
                .await
                .with_context(|| format!("Failed to open {}", cfg.metastore_path.display()))?;
            info!(path = %cfg.metastore_path.display(), "metastore: file-backed");
            let store: Arc<dyn DocumentStore> = Arc::new(store);
            let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());
            (store, queue)
        }
    };

    let repo = MetadataRepository::new(store);

    // RECOVERY: tasks left unfinished by a previous run go back on the queue
    if let Err(e) = requeue_unfinished(&repo, queue.as_ref()).await {
        warn!(error = %e, "recovery: requeue failed");
    }

    let backend = ProcessBackend::new(&cfg.backend_program, cfg.backend_args.clone());
    let datasets = FsDatasetStorage::new(&cfg.data_root);
    let executor = Arc::new(JobExecutor::new(
        repo,
        Arc::new(backend),
        Arc::new(datasets),
        queue,
    ));

    let cancel = CancellationToken::new();
    let opts = WorkerOptions {
        worker_id: wid,
        max_concurrent: cfg.worker_concurrency,
        poll_every: cfg.poll_every,
        heartbeat_every: cfg.heartbeat_every(),
    };
    let worker = tokio::spawn(run_worker_loop(executor, opts, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested, waiting for running tasks");
    cancel.cancel();
    worker.await.context("worker loop panicked")?;

    Ok(())
}

async fn check_postgres(pg_pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pg_pool)
        .await
        .context("Postgres ping failed")?;
    Ok(())
}
