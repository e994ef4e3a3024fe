//! Job workers and the update-tips scheduler
//!
//! Each worker runs one loop: claim, execute under the lease as a
//! wall-clock timeout, then complete or fail. Conversion owns its temp
//! artifacts; on any failure they are removed, while the inbound upload
//! file is removed only on success so terminal failures stay inspectable.

use super::{ConvertPayload, Job, JobKind, JobQueue};
use crate::cache::CacheTier;
use crate::dump::DumpWriter;
use crate::error::{Error, ErrorKind, Result};
use crate::importer;
use crate::metrics::Metrics;
use crate::repohost::{discover_and_update_commit, RepoHost};
use crate::storage::StorageLayout;
use crate::xrepo::CrossRepoIndex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

/// Everything a worker loop needs, shared across workers.
pub struct WorkerContext {
    pub storage: StorageLayout,
    pub xrepo: Arc<CrossRepoIndex>,
    pub caches: Arc<CacheTier>,
    pub queue: Arc<JobQueue>,
    pub repo_host: Arc<dyn RepoHost>,
    pub metrics: Arc<Metrics>,
    /// Delay between polls when the queue is empty.
    pub poll_interval: Duration,
}

/// Run one worker loop forever.
pub async fn run_worker(ctx: Arc<WorkerContext>) {
    info!("worker started");
    loop {
        match ctx.queue.claim().await {
            Ok(Some(job)) => {
                execute_job(&ctx, &job).await;
            }
            Ok(None) => {
                sample_queue_depth(&ctx).await;
                sleep(ctx.poll_interval).await;
            }
            Err(err) => {
                error!(error = %err, "failed to poll the job queue");
                sleep(ctx.poll_interval).await;
            }
        }
    }
}

/// Periodically enqueue the update-tips singleton.
pub async fn run_tips_scheduler(queue: Arc<JobQueue>, period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        match queue
            .enqueue_singleton(JobKind::UpdateTips, serde_json::json!({}))
            .await
        {
            Ok(Some(id)) => debug!(job_id = id, "scheduled update-tips"),
            Ok(None) => debug!("update-tips already pending"),
            Err(err) => warn!(error = %err, "failed to schedule update-tips"),
        }
    }
}

async fn sample_queue_depth(ctx: &WorkerContext) {
    if let Ok(counts) = ctx.queue.counts().await {
        ctx.metrics
            .queue_depth
            .store(counts.queued as i64 + counts.active as i64, Ordering::Relaxed);
    }
}

/// Execute one claimed job end to end, including queue bookkeeping and
/// metrics. The lease doubles as the job's wall-clock timeout.
pub async fn execute_job(ctx: &WorkerContext, job: &Job) {
    let job_metrics = match job.kind {
        JobKind::Convert => &ctx.metrics.convert_jobs,
        JobKind::UpdateTips => &ctx.metrics.update_tips_jobs,
    };
    let started = Instant::now();
    let outcome = timeout(ctx.queue.lease(), handle_job(ctx, job)).await;
    job_metrics.duration.observe(started.elapsed());

    let result = match outcome {
        Ok(result) => result,
        Err(_elapsed) => Err(Error::Fatal(format!(
            "job timed out after {:?}",
            ctx.queue.lease()
        ))),
    };

    match result {
        Ok(()) => {
            job_metrics.completed.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = ctx.queue.complete(job).await {
                error!(job_id = job.id, error = %err, "failed to mark job completed");
            }
        }
        Err(err) => {
            job_metrics.failed.fetch_add(1, Ordering::Relaxed);
            // Everything except a rejected payload is worth retrying.
            let retryable = err.kind() != ErrorKind::InvalidPayload;
            if let Err(mark_err) = ctx.queue.fail(job, &err.to_string(), retryable).await {
                error!(job_id = job.id, error = %mark_err, "failed to mark job failed");
            }
        }
    }
}

async fn handle_job(ctx: &WorkerContext, job: &Job) -> Result<()> {
    match job.kind {
        JobKind::Convert => {
            let payload: ConvertPayload = serde_json::from_value(job.payload.clone())
                .map_err(|err| Error::Fatal(format!("corrupt convert payload: {err}")))?;
            convert_upload(ctx, &payload).await
        }
        JobKind::UpdateTips => update_tips(ctx).await,
    }
}

/// Run the importer over a spooled upload and register the result.
///
/// Step order is what makes a retried conversion safe: the dump store is
/// built in `tmp/`, the cross-repo rows land in one transaction (an upsert
/// replacing any prior dump for the same coordinates), and only then is
/// the file renamed into place. Readers never observe a dump row without
/// its file.
async fn convert_upload(ctx: &WorkerContext, payload: &ConvertPayload) -> Result<()> {
    let temp_path = ctx.storage.new_temp_db_path();
    let result = async {
        let upload = std::fs::File::open(&payload.upload_path)?;
        let writer = DumpWriter::create(&temp_path).await?;
        let summary = importer::convert(upload, &writer).await?;

        discover_and_update_commit(
            &ctx.xrepo,
            ctx.repo_host.as_ref(),
            &payload.repository,
            &payload.commit,
        )
        .await?;

        let dump = ctx
            .xrepo
            .add_packages_and_references(
                &payload.repository,
                &payload.commit,
                &payload.root,
                &summary.packages,
                &summary.references,
            )
            .await?;

        let final_path = ctx.storage.promote_temp_db(&temp_path, dump.id)?;
        // A replaced dump must not be served from a stale handle.
        ctx.caches.invalidate_dump(&final_path).await;

        info!(
            repository = %payload.repository,
            commit = %payload.commit,
            root = %payload.root,
            dump_id = dump.id,
            documents = summary.num_documents,
            "converted upload"
        );
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            // The upload spool file is consumed only on success.
            if let Err(err) = std::fs::remove_file(&payload.upload_path) {
                warn!(
                    path = %payload.upload_path.display(),
                    error = %err,
                    "could not remove consumed upload"
                );
            }
            Ok(())
        }
        Err(err) => {
            if temp_path.exists() {
                let _ = std::fs::remove_file(&temp_path);
            }
            Err(err)
        }
    }
}

/// Refresh `visible_at_tip` for every repository with dumps.
async fn update_tips(ctx: &WorkerContext) -> Result<()> {
    for repository in ctx.xrepo.repositories_with_dumps().await? {
        match ctx.repo_host.default_branch_tip(&repository).await? {
            Some(tip) => {
                discover_and_update_commit(&ctx.xrepo, ctx.repo_host.as_ref(), &repository, &tip)
                    .await?;
                ctx.xrepo
                    .update_dumps_visible_from_tip(&repository, &tip)
                    .await?;
                debug!(%repository, %tip, "updated tip visibility");
            }
            None => debug!(%repository, "repository host knows no tip"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::importer::test_fixtures::{gzip_lines, sample_dump_lines};
    use crate::queue::convert_payload;
    use crate::repohost::StaticRepoHost;
    use clap::Parser;

    async fn context(dir: &tempfile::TempDir) -> (Arc<WorkerContext>, Arc<StaticRepoHost>) {
        let storage = StorageLayout::init(dir.path()).unwrap();
        let xrepo = Arc::new(CrossRepoIndex::open(&storage.xrepo_db_path()).await.unwrap());
        let queue = Arc::new(JobQueue::new(
            xrepo.clone(),
            3,
            Duration::from_secs(60),
        ));
        let config = Config::parse_from(["lsif-daemon"]);
        let host = Arc::new(StaticRepoHost::new());
        let ctx = Arc::new(WorkerContext {
            storage,
            xrepo,
            caches: Arc::new(CacheTier::new(&config)),
            queue,
            repo_host: host.clone(),
            metrics: Arc::new(Metrics::default()),
            poll_interval: Duration::from_millis(10),
        });
        (ctx, host)
    }

    fn spool_upload(ctx: &WorkerContext, lines: &[String]) -> std::path::PathBuf {
        let path = ctx.storage.new_upload_path();
        std::fs::write(&path, gzip_lines(lines)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_convert_job_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _host) = context(&dir).await;
        let commit = "b".repeat(40);
        let upload = spool_upload(&ctx, &sample_dump_lines("src/a.ts", "npm", "lib", "lib:foo"));

        ctx.queue
            .enqueue(
                JobKind::Convert,
                convert_payload(&ConvertPayload {
                    repository: "repo".to_string(),
                    commit: commit.clone(),
                    root: String::new(),
                    upload_path: upload.clone(),
                }),
            )
            .await
            .unwrap();

        let job = ctx.queue.claim().await.unwrap().unwrap();
        execute_job(&ctx, &job).await;

        let dump = ctx
            .xrepo
            .get_dump("repo", &commit, "")
            .await
            .unwrap()
            .expect("dump registered");
        assert!(ctx.storage.dump_path(dump.id).exists());
        assert!(!upload.exists(), "consumed upload must be unlinked");
        assert_eq!(ctx.queue.counts().await.unwrap().completed, 1);
        assert_eq!(
            ctx.metrics.convert_jobs.completed.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_terminally_and_keeps_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _host) = context(&dir).await;
        // Missing metaData: rejected by the importer.
        let upload = spool_upload(
            &ctx,
            &[r#"{"id":1,"type":"vertex","label":"document","uri":"a.ts"}"#.to_string()],
        );

        ctx.queue
            .enqueue(
                JobKind::Convert,
                convert_payload(&ConvertPayload {
                    repository: "repo".to_string(),
                    commit: "c".repeat(40),
                    root: String::new(),
                    upload_path: upload.clone(),
                }),
            )
            .await
            .unwrap();

        let job = ctx.queue.claim().await.unwrap().unwrap();
        execute_job(&ctx, &job).await;

        let counts = ctx.queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1, "invalid payload must not retry");
        assert!(upload.exists(), "failed upload kept for inspection");
        // No dump row and no stray files under tmp/ or the root.
        assert!(ctx.xrepo.get_dumps("repo").await.unwrap().is_empty());
        let tmp_entries: Vec<_> = std::fs::read_dir(dir.path().join("tmp"))
            .unwrap()
            .collect();
        assert!(tmp_entries.is_empty());
    }

    #[tokio::test]
    async fn test_missing_upload_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _host) = context(&dir).await;
        ctx.queue
            .enqueue(
                JobKind::Convert,
                convert_payload(&ConvertPayload {
                    repository: "repo".to_string(),
                    commit: "d".repeat(40),
                    root: String::new(),
                    upload_path: dir.path().join("uploads/nonexistent"),
                }),
            )
            .await
            .unwrap();

        let job = ctx.queue.claim().await.unwrap().unwrap();
        execute_job(&ctx, &job).await;

        // Transient failure: requeued, not parked.
        let counts = ctx.queue.counts().await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn test_update_tips_job() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, host) = context(&dir).await;
        let tip = "e".repeat(40);
        ctx.xrepo
            .add_packages_and_references("repo", &tip, "", &[], &[])
            .await
            .unwrap();
        ctx.xrepo
            .add_packages_and_references("repo", &"f".repeat(40), "", &[], &[])
            .await
            .unwrap();
        host.set_tip("repo", &tip).await;

        ctx.queue
            .enqueue_singleton(JobKind::UpdateTips, serde_json::json!({}))
            .await
            .unwrap();
        let job = ctx.queue.claim().await.unwrap().unwrap();
        execute_job(&ctx, &job).await;

        for dump in ctx.xrepo.get_dumps("repo").await.unwrap() {
            assert_eq!(dump.visible_at_tip, dump.commit == tip);
        }
    }
}
