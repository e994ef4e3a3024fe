use anyhow::Result;
use clap::Parser;
use lsif_daemon::backend::Backend;
use lsif_daemon::cache::CacheTier;
use lsif_daemon::config::{Config, Mode};
use lsif_daemon::metrics::Metrics;
use lsif_daemon::queue::worker::{run_tips_scheduler, run_worker, WorkerContext};
use lsif_daemon::queue::JobQueue;
use lsif_daemon::repohost::{RepoHost, StaticRepoHost};
use lsif_daemon::server::{self, AppState};
use lsif_daemon::storage::StorageLayout;
use lsif_daemon::xrepo::CrossRepoIndex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?config.mode,
        storage_root = %config.storage_root.display(),
        "starting lsif daemon"
    );

    let storage = StorageLayout::init(&config.storage_root)?;
    let xrepo = Arc::new(CrossRepoIndex::open(&storage.xrepo_db_path()).await?);
    storage.migrate_filenames(&xrepo).await?;

    let caches = Arc::new(CacheTier::new(&config));
    let metrics = Arc::new(Metrics::default());
    let repo_host: Arc<dyn RepoHost> = Arc::new(StaticRepoHost::new());
    let queue = Arc::new(JobQueue::new(
        xrepo.clone(),
        config.job_max_attempts,
        config.job_lease(),
    ));
    let backend = Arc::new(Backend::new(
        storage.clone(),
        xrepo.clone(),
        caches.clone(),
        repo_host.clone(),
    ));

    let state = AppState {
        backend,
        queue: queue.clone(),
        storage: storage.clone(),
        metrics: metrics.clone(),
        request_timeout: config.request_timeout(),
    };

    if matches!(config.mode, Mode::Worker | Mode::All) {
        let ctx = Arc::new(WorkerContext {
            storage,
            xrepo,
            caches,
            queue: queue.clone(),
            repo_host,
            metrics,
            poll_interval: Duration::from_secs(1),
        });
        for worker_id in 0..config.worker_concurrency.max(1) {
            let ctx = ctx.clone();
            info!(worker_id, "spawning conversion worker");
            tokio::spawn(run_worker(ctx));
        }
        tokio::spawn(run_tips_scheduler(queue, config.heads_interval()));
    }

    match config.mode {
        Mode::Serve | Mode::All => server::serve(state, config.http_port).await,
        Mode::Worker => server::serve_worker_metrics(state, config.worker_metrics_port).await,
    }
}
