//! End-to-end scenarios over an in-process daemon
//!
//! Each test stands up the full stack — storage root in a tempdir, the
//! cross-repo index, the job queue, and the HTTP router — uploads LSIF
//! payloads through `/upload`, drains the queue with the real worker, and
//! queries through `/request` and `/exists`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::BodyExt;
use lsif_daemon::backend::Backend;
use lsif_daemon::cache::CacheTier;
use lsif_daemon::config::Config;
use lsif_daemon::metrics::Metrics;
use lsif_daemon::queue::worker::{execute_job, WorkerContext};
use lsif_daemon::queue::JobQueue;
use lsif_daemon::repohost::StaticRepoHost;
use lsif_daemon::server::{router, AppState};
use lsif_daemon::storage::StorageLayout;
use lsif_daemon::xrepo::CrossRepoIndex;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

use clap::Parser;

struct Harness {
    _dir: tempfile::TempDir,
    router: Router,
    ctx: Arc<WorkerContext>,
    host: Arc<StaticRepoHost>,
    xrepo: Arc<CrossRepoIndex>,
    queue: Arc<JobQueue>,
    storage: StorageLayout,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = StorageLayout::init(dir.path()).unwrap();
    let xrepo = Arc::new(CrossRepoIndex::open(&storage.xrepo_db_path()).await.unwrap());
    let queue = Arc::new(
        JobQueue::new(xrepo.clone(), 3, Duration::from_secs(60))
            .with_backoff_base(Duration::from_millis(0)),
    );
    let config = Config::parse_from(["lsif-daemon"]);
    let caches = Arc::new(CacheTier::new(&config));
    let metrics = Arc::new(Metrics::default());
    let host = Arc::new(StaticRepoHost::new());

    let backend = Arc::new(Backend::new(
        storage.clone(),
        xrepo.clone(),
        caches.clone(),
        host.clone(),
    ));
    let state = AppState {
        backend,
        queue: queue.clone(),
        storage: storage.clone(),
        metrics: metrics.clone(),
        request_timeout: Duration::from_secs(30),
    };
    let ctx = Arc::new(WorkerContext {
        storage: storage.clone(),
        xrepo: xrepo.clone(),
        caches,
        queue: queue.clone(),
        repo_host: host.clone(),
        metrics,
        poll_interval: Duration::from_millis(5),
    });

    Harness {
        _dir: dir,
        router: router(state),
        ctx,
        host,
        xrepo,
        queue,
        storage,
    }
}

impl Harness {
    /// Drain every currently claimable job.
    async fn drain_queue(&self) {
        while let Some(job) = self.queue.claim().await.unwrap() {
            execute_job(&self.ctx, &job).await;
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, value)
    }

    async fn upload(&self, repository: &str, commit: &str, lines: &[String]) -> StatusCode {
        let request = Request::builder()
            .method("POST")
            .uri(format!(
                "/upload?repository={repository}&commit={commit}"
            ))
            .body(Body::from(gzip_lines(lines)))
            .unwrap();
        let (status, _) = self.send(request).await;
        status
    }

    async fn request_method(
        &self,
        repository: &str,
        commit: &str,
        path: &str,
        line: u32,
        character: u32,
        method: &str,
    ) -> (StatusCode, Value) {
        let body = json!({
            "path": path,
            "position": { "line": line, "character": character },
            "method": method,
        });
        let request = Request::builder()
            .method("POST")
            .uri(format!("/request?repository={repository}&commit={commit}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn exists(&self, repository: &str, commit: &str, file: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(format!(
                "/exists?repository={repository}&commit={commit}&file={file}"
            ))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }
}

fn gzip_lines(lines: &[String]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in lines {
        encoder.write_all(line.as_bytes()).unwrap();
        encoder.write_all(b"\n").unwrap();
    }
    encoder.finish().unwrap()
}

fn commit(n: u8) -> String {
    format!("{:040x}", n)
}

/// One interface declaration with two concrete definitions and two uses,
/// all sharing one merged reference result. Mirrors a TypeScript indexer's
/// output for an abstract `foo` with implementations.
fn interface_dump_lines() -> Vec<String> {
    [
        r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3","projectRoot":"file:///p"}"#,
        r#"{"id":2,"type":"vertex","label":"document","uri":"src/index.ts"}"#,
        // Ranges: declaration, two definitions, two uses.
        r#"{"id":10,"type":"vertex","label":"range","start":{"line":1,"character":4},"end":{"line":1,"character":7}}"#,
        r#"{"id":11,"type":"vertex","label":"range","start":{"line":5,"character":4},"end":{"line":5,"character":7}}"#,
        r#"{"id":12,"type":"vertex","label":"range","start":{"line":9,"character":4},"end":{"line":9,"character":7}}"#,
        r#"{"id":13,"type":"vertex","label":"range","start":{"line":13,"character":2},"end":{"line":13,"character":5}}"#,
        r#"{"id":14,"type":"vertex","label":"range","start":{"line":16,"character":2},"end":{"line":16,"character":5}}"#,
        r#"{"id":20,"type":"vertex","label":"resultSet"}"#,
        r#"{"id":21,"type":"vertex","label":"resultSet"}"#,
        r#"{"id":22,"type":"vertex","label":"resultSet"}"#,
        r#"{"id":23,"type":"edge","label":"next","outV":10,"inV":20}"#,
        r#"{"id":24,"type":"edge","label":"next","outV":13,"inV":20}"#,
        r#"{"id":25,"type":"edge","label":"next","outV":14,"inV":20}"#,
        r#"{"id":26,"type":"edge","label":"next","outV":11,"inV":21}"#,
        r#"{"id":27,"type":"edge","label":"next","outV":12,"inV":22}"#,
        // Definition results per declaration site.
        r#"{"id":30,"type":"vertex","label":"definitionResult"}"#,
        r#"{"id":31,"type":"vertex","label":"definitionResult"}"#,
        r#"{"id":32,"type":"vertex","label":"definitionResult"}"#,
        r#"{"id":33,"type":"edge","label":"textDocument/definition","outV":20,"inV":30}"#,
        r#"{"id":34,"type":"edge","label":"textDocument/definition","outV":21,"inV":31}"#,
        r#"{"id":35,"type":"edge","label":"textDocument/definition","outV":22,"inV":32}"#,
        r#"{"id":36,"type":"edge","label":"item","outV":30,"inVs":[10],"document":2}"#,
        r#"{"id":37,"type":"edge","label":"item","outV":31,"inVs":[11],"document":2}"#,
        r#"{"id":38,"type":"edge","label":"item","outV":32,"inVs":[12],"document":2}"#,
        // Reference results, linked through the declaration's result.
        r#"{"id":40,"type":"vertex","label":"referenceResult"}"#,
        r#"{"id":41,"type":"vertex","label":"referenceResult"}"#,
        r#"{"id":42,"type":"vertex","label":"referenceResult"}"#,
        r#"{"id":43,"type":"edge","label":"textDocument/references","outV":20,"inV":40}"#,
        r#"{"id":44,"type":"edge","label":"textDocument/references","outV":21,"inV":41}"#,
        r#"{"id":45,"type":"edge","label":"textDocument/references","outV":22,"inV":42}"#,
        r#"{"id":46,"type":"edge","label":"item","outV":40,"inVs":[10],"document":2,"property":"definitions"}"#,
        r#"{"id":47,"type":"edge","label":"item","outV":40,"inVs":[13,14],"document":2,"property":"references"}"#,
        r#"{"id":48,"type":"edge","label":"item","outV":41,"inVs":[11],"document":2,"property":"definitions"}"#,
        r#"{"id":49,"type":"edge","label":"item","outV":42,"inVs":[12],"document":2,"property":"definitions"}"#,
        r#"{"id":50,"type":"edge","label":"item","outV":40,"inVs":[41,42],"document":2,"property":"referenceResults"}"#,
        r#"{"id":60,"type":"edge","label":"contains","outV":2,"inVs":[10,11,12,13,14]}"#,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// A dump exporting `lib:X` from `src/lib.ts`.
fn exporting_dump_lines() -> Vec<String> {
    [
        r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3","projectRoot":"file:///p"}"#,
        r#"{"id":2,"type":"vertex","label":"document","uri":"src/lib.ts"}"#,
        r#"{"id":3,"type":"vertex","label":"resultSet"}"#,
        r#"{"id":4,"type":"vertex","label":"range","start":{"line":0,"character":9},"end":{"line":0,"character":10}}"#,
        r#"{"id":5,"type":"edge","label":"next","outV":4,"inV":3}"#,
        r#"{"id":6,"type":"vertex","label":"definitionResult"}"#,
        r#"{"id":7,"type":"edge","label":"textDocument/definition","outV":3,"inV":6}"#,
        r#"{"id":8,"type":"edge","label":"item","outV":6,"inVs":[4],"document":2}"#,
        r#"{"id":9,"type":"vertex","label":"referenceResult"}"#,
        r#"{"id":10,"type":"edge","label":"textDocument/references","outV":3,"inV":9}"#,
        r#"{"id":11,"type":"edge","label":"item","outV":9,"inVs":[4],"document":2,"property":"definitions"}"#,
        r#"{"id":12,"type":"vertex","label":"moniker","kind":"export","scheme":"npm","identifier":"lib:X"}"#,
        r#"{"id":13,"type":"edge","label":"moniker","outV":3,"inV":12}"#,
        r#"{"id":14,"type":"vertex","label":"packageInformation","name":"lib","version":"1"}"#,
        r#"{"id":15,"type":"edge","label":"packageInformation","outV":12,"inV":14}"#,
        r#"{"id":16,"type":"edge","label":"contains","outV":2,"inVs":[4]}"#,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// A dump importing `lib:X` and using it once in `src/use.ts`.
fn importing_dump_lines() -> Vec<String> {
    [
        r#"{"id":1,"type":"vertex","label":"metaData","version":"0.4.3","projectRoot":"file:///p"}"#,
        r#"{"id":2,"type":"vertex","label":"document","uri":"src/use.ts"}"#,
        r#"{"id":3,"type":"vertex","label":"resultSet"}"#,
        r#"{"id":4,"type":"vertex","label":"range","start":{"line":2,"character":1},"end":{"line":2,"character":2}}"#,
        r#"{"id":5,"type":"edge","label":"next","outV":4,"inV":3}"#,
        r#"{"id":6,"type":"vertex","label":"referenceResult"}"#,
        r#"{"id":7,"type":"edge","label":"textDocument/references","outV":3,"inV":6}"#,
        r#"{"id":8,"type":"edge","label":"item","outV":6,"inVs":[4],"document":2,"property":"references"}"#,
        r#"{"id":9,"type":"vertex","label":"moniker","kind":"import","scheme":"npm","identifier":"lib:X"}"#,
        r#"{"id":10,"type":"edge","label":"moniker","outV":3,"inV":9}"#,
        r#"{"id":11,"type":"vertex","label":"packageInformation","name":"lib","version":"1"}"#,
        r#"{"id":12,"type":"edge","label":"packageInformation","outV":9,"inV":11}"#,
        r#"{"id":13,"type":"edge","label":"contains","outV":2,"inVs":[4]}"#,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[tokio::test]
async fn test_references_closure_over_interface_and_implementations() {
    let h = harness().await;
    let c = commit(1);
    assert_eq!(h.upload("test", &c, &interface_dump_lines()).await, StatusCode::OK);
    h.drain_queue().await;

    // Every declaration and every use resolves to the same five locations.
    for (line, character) in [(1, 5), (5, 5), (9, 5), (13, 3), (16, 3)] {
        let (status, value) = h
            .request_method("test", &c, "src/index.ts", line, character, "references")
            .await;
        assert_eq!(status, StatusCode::OK);
        let locations = value.as_array().unwrap();
        assert_eq!(
            locations.len(),
            5,
            "expected 5 references from ({line},{character}), got {locations:?}"
        );
        let lines: Vec<u64> = locations
            .iter()
            .map(|l| l["range"]["start"]["line"].as_u64().unwrap())
            .collect();
        assert_eq!(lines, vec![1, 5, 9, 13, 16]);
    }
}

#[tokio::test]
async fn test_exists_positive_and_negative() {
    let h = harness().await;
    let c = commit(2);
    h.upload("test", &c, &interface_dump_lines()).await;
    h.drain_queue().await;

    let (status, value) = h.exists("test", &c, "src/index.ts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, Value::Bool(true));

    let (status, value) = h.exists("test", &c, "src/missing.ts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, Value::Bool(false));
}

#[tokio::test]
async fn test_nearest_ancestor_selection() {
    let h = harness().await;
    let (c1, c2, c3) = (commit(0x11), commit(0x12), commit(0x13));
    h.host.set_parents("test", &c2, vec![c1.clone()]).await;
    h.host.set_parents("test", &c3, vec![c2.clone()]).await;

    h.upload("test", &c1, &interface_dump_lines()).await;
    h.upload("test", &c3, &exporting_dump_lines()).await;
    h.drain_queue().await;

    // Querying c2 finds the c1 dump (nearest ancestor), not c3's.
    let (status, value) = h
        .request_method("test", &c2, "src/index.ts", 1, 5, "definitions")
        .await;
    assert_eq!(status, StatusCode::OK);
    let locations = value.as_array().unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0]["commit"].as_str().unwrap(), c1);
}

#[tokio::test]
async fn test_cross_repo_references() {
    let h = harness().await;
    let (ca, cb) = (commit(0x21), commit(0x22));
    h.upload("a-repo", &ca, &exporting_dump_lines()).await;
    h.upload("b-repo", &cb, &importing_dump_lines()).await;
    h.drain_queue().await;

    // References of X from its definition in a-repo: the local def plus
    // b-repo's use.
    let (status, value) = h
        .request_method("a-repo", &ca, "src/lib.ts", 0, 9, "references")
        .await;
    assert_eq!(status, StatusCode::OK);
    let locations = value.as_array().unwrap();
    assert_eq!(locations.len(), 2, "got {locations:?}");

    let repos: Vec<&str> = locations
        .iter()
        .map(|l| l["repository"].as_str().unwrap())
        .collect();
    assert!(repos.contains(&"a-repo"));
    assert!(repos.contains(&"b-repo"));

    let remote = locations
        .iter()
        .find(|l| l["repository"] == "b-repo")
        .unwrap();
    assert_eq!(remote["path"].as_str().unwrap(), "src/use.ts");
    assert_eq!(remote["range"]["start"]["line"].as_u64().unwrap(), 2);
}

#[tokio::test]
async fn test_malformed_upload_is_rejected_without_artifacts() {
    let h = harness().await;
    let lines = vec![r#"{"id":1,"type":"vertex","label":"document","uri":"a.ts"}"#.to_string()];
    let status = h.upload("test", &commit(3), &lines).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // Nothing spooled, nothing converted, nothing enqueued.
    let uploads: Vec<_> = std::fs::read_dir(h.storage.root().join("uploads"))
        .unwrap()
        .collect();
    assert!(uploads.is_empty());
    assert!(h.xrepo.get_dumps("test").await.unwrap().is_empty());
    assert_eq!(h.queue.counts().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_convert_idempotence() {
    let h = harness().await;
    let c = commit(4);
    h.upload("test", &c, &exporting_dump_lines()).await;
    h.drain_queue().await;
    h.upload("test", &c, &exporting_dump_lines()).await;
    h.drain_queue().await;

    let dumps = h.xrepo.get_dumps("test").await.unwrap();
    assert_eq!(dumps.len(), 1, "same coordinates must upsert, not duplicate");

    let package = lsif_daemon::models::Package {
        scheme: "npm".to_string(),
        name: "lib".to_string(),
        version: "1".to_string(),
    };
    let defining = h.xrepo.find_defining_dump(&package).await.unwrap().unwrap();
    assert_eq!(defining.id, dumps[0].id);
    assert!(h.storage.dump_path(dumps[0].id).exists());

    // Still answers queries after the replacement.
    let (status, value) = h
        .request_method("test", &c, "src/lib.ts", 0, 9, "definitions")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_transient_failure_retries_to_success() {
    let h = harness().await;
    let c = commit(5);
    // Enqueue a convert job whose upload does not exist yet: the first
    // attempt fails with a transient error and requeues (zero backoff in
    // this harness).
    let upload_path = h.storage.new_upload_path();
    h.queue
        .enqueue(
            lsif_daemon::queue::JobKind::Convert,
            lsif_daemon::queue::convert_payload(&lsif_daemon::queue::ConvertPayload {
                repository: "test".to_string(),
                commit: c.clone(),
                root: String::new(),
                upload_path: upload_path.clone(),
            }),
        )
        .await
        .unwrap();

    let job = h.queue.claim().await.unwrap().unwrap();
    execute_job(&h.ctx, &job).await;
    assert_eq!(h.queue.counts().await.unwrap().queued, 1);
    assert!(h.xrepo.get_dumps("test").await.unwrap().is_empty());

    // The upload arrives; the retry converts it.
    std::fs::write(&upload_path, gzip_lines(&exporting_dump_lines())).unwrap();
    h.drain_queue().await;

    let dumps = h.xrepo.get_dumps("test").await.unwrap();
    assert_eq!(dumps.len(), 1, "retry must produce exactly one dump row");
    assert_eq!(h.queue.counts().await.unwrap().completed, 1);
}

#[tokio::test]
async fn test_hover_and_unknown_method() {
    let h = harness().await;
    let c = commit(6);
    h.upload("test", &c, &interface_dump_lines()).await;
    h.drain_queue().await;

    // This fixture carries no hover data; the response is an empty 200.
    let (status, value) = h
        .request_method("test", &c, "src/index.ts", 1, 5, "hover")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, Value::Null);

    let (status, _) = h
        .request_method("test", &c, "src/index.ts", 1, 5, "rename")
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_bad_coordinates_are_rejected() {
    let h = harness().await;
    let status = h.upload("", &commit(7), &exporting_dump_lines()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let status = h.upload("test", "not-a-commit", &exporting_dump_lines()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.exists("test", "beef", "src/a.ts").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_not_indexed_is_empty_success() {
    let h = harness().await;
    let (status, value) = h
        .request_method("ghost", &commit(8), "src/a.ts", 0, 0, "references")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, json!([]));

    let (status, value) = h.exists("ghost", &commit(8), "src/a.ts").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, Value::Bool(false));
}

#[tokio::test]
async fn test_health_and_metrics_endpoints() {
    let h = harness().await;
    let (status, value) = h
        .send(
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value, Value::String("ok".to_string()));

    h.upload("test", &commit(9), &exporting_dump_lines()).await;
    h.drain_queue().await;

    let (status, value) = h
        .send(
            Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let text = value.as_str().unwrap().to_string();
    assert!(text.contains("lsif_uploads_total{result=\"accepted\"} 1"));
    assert!(text.contains("lsif_jobs_total{kind=\"convert\",result=\"completed\"} 1"));
}
