//! HTTP surface
//!
//! Four routes: upload intake, the exists probe, the code-intelligence
//! request dispatcher, and the operational endpoints (`/healthz`, `/ping`,
//! `/metrics`). Errors map per the daemon-wide taxonomy: bad parameters to
//! 400, rejected payloads to 422, "not indexed" to an empty 200, and
//! everything else to a logged 500 with a short message.

use crate::backend::Backend;
use crate::error::{Error, ErrorKind};
use crate::metrics::Metrics;
use crate::models::Position;
use crate::queue::{convert_payload, ConvertPayload, JobKind, JobQueue};
use crate::storage::StorageLayout;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{body::Bytes, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<Backend>,
    pub queue: Arc<JobQueue>,
    pub storage: StorageLayout,
    pub metrics: Arc<Metrics>,
    pub request_timeout: Duration,
}

/// Response-side error wrapper so handlers can use `?` on crate errors.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/exists", post(exists))
        .route("/request", post(request))
        .route("/healthz", get(ok))
        .route("/ping", get(ok))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http surface listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// A stripped-down router for worker processes: health and metrics only.
pub async fn serve_worker_metrics(state: AppState, port: u16) -> anyhow::Result<()> {
    let router = Router::new()
        .route("/healthz", get(ok))
        .route("/ping", get(ok))
        .route("/metrics", get(metrics))
        .with_state(state);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "worker metrics listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn ok() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> String {
    let caches = state.backend.caches();
    let cache_stats = [
        ("connections", caches.connections.stats()),
        ("documents", caches.documents.stats()),
        ("result_chunks", caches.chunks.stats()),
    ];
    state.metrics.render(&cache_stats)
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    repository: Option<String>,
    commit: Option<String>,
    root: Option<String>,
    #[serde(rename = "skipValidation")]
    skip_validation: Option<bool>,
}

async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let (repository, commit) = validate_coordinates(params.repository, params.commit)?;
    let root = normalize_root(params.root.as_deref());

    if !params.skip_validation.unwrap_or(false) {
        if let Err(err) = crate::importer::validate(&body[..]) {
            state.metrics.uploads_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ApiError::from(Error::InvalidPayload(err)));
        }
    }

    let upload_path = state.storage.new_upload_path();
    tokio::fs::write(&upload_path, &body)
        .await
        .map_err(Error::from)?;

    state.backend.discover_commit(&repository, &commit).await?;
    let job_id = state
        .queue
        .enqueue(
            JobKind::Convert,
            convert_payload(&ConvertPayload {
                repository: repository.clone(),
                commit: commit.clone(),
                root,
                upload_path,
            }),
        )
        .await?;

    state.metrics.uploads_accepted.fetch_add(1, Ordering::Relaxed);
    info!(%repository, %commit, job_id, "accepted upload");
    Ok(Json(json!({ "id": job_id })))
}

#[derive(Debug, Deserialize)]
struct ExistsParams {
    repository: Option<String>,
    commit: Option<String>,
    file: Option<String>,
}

async fn exists(
    State(state): State<AppState>,
    Query(params): Query<ExistsParams>,
) -> ApiResult<Json<bool>> {
    let (repository, commit) = validate_coordinates(params.repository, params.commit)?;
    let file = params
        .file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| ApiError::from(Error::BadInput("must specify file".to_string())))?;

    state.metrics.requests_exists.fetch_add(1, Ordering::Relaxed);
    let found = with_deadline(
        state.request_timeout,
        state.backend.exists(&repository, &commit, &file),
    )
    .await?;
    Ok(Json(found))
}

#[derive(Debug, Deserialize)]
struct RequestParams {
    repository: Option<String>,
    commit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RequestBody {
    path: String,
    position: Position,
    method: String,
}

async fn request(
    State(state): State<AppState>,
    Query(params): Query<RequestParams>,
    Json(body): Json<RequestBody>,
) -> ApiResult<Json<Value>> {
    let (repository, commit) = validate_coordinates(params.repository, params.commit)?;
    let path = &body.path;
    let position = body.position;
    let deadline = state.request_timeout;

    match body.method.as_str() {
        "definitions" => {
            state
                .metrics
                .requests_definitions
                .fetch_add(1, Ordering::Relaxed);
            let result = with_deadline(
                deadline,
                state.backend.definitions(&repository, &commit, path, position),
            )
            .await;
            empty_when_not_indexed(&state, result, json!([])).map(Json)
        }
        "references" => {
            state
                .metrics
                .requests_references
                .fetch_add(1, Ordering::Relaxed);
            let result = with_deadline(
                deadline,
                state.backend.references(&repository, &commit, path, position),
            )
            .await;
            empty_when_not_indexed(&state, result, json!([])).map(Json)
        }
        "hover" => {
            state.metrics.requests_hover.fetch_add(1, Ordering::Relaxed);
            let result = with_deadline(
                deadline,
                state.backend.hover(&repository, &commit, path, position),
            )
            .await;
            empty_when_not_indexed(&state, result, Value::Null).map(Json)
        }
        other => Err(ApiError {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: format!("method {other:?} must be one of definitions, references, hover"),
        }),
    }
}

/// Serialize a backend result, flattening `NotIndexed` into the method's
/// empty value with a successful status.
fn empty_when_not_indexed<T: serde::Serialize>(
    state: &AppState,
    result: crate::error::Result<T>,
    empty: Value,
) -> ApiResult<Value> {
    match result {
        Ok(value) => Ok(serde_json::to_value(value).map_err(Error::from)?),
        Err(err) if err.kind() == ErrorKind::NotIndexed => {
            state
                .metrics
                .requests_not_indexed
                .fetch_add(1, Ordering::Relaxed);
            Ok(empty)
        }
        Err(err) => {
            state.metrics.request_errors.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::from(err))
        }
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = crate::error::Result<T>>,
) -> crate::error::Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Fatal(format!(
            "request deadline of {deadline:?} exceeded"
        ))),
    }
}

fn validate_coordinates(
    repository: Option<String>,
    commit: Option<String>,
) -> ApiResult<(String, String)> {
    let repository = repository
        .filter(|r| !r.is_empty())
        .ok_or_else(|| ApiError::from(Error::BadInput("must specify repository".to_string())))?;
    let commit = commit
        .filter(|c| c.len() == 40 && c.chars().all(|ch| ch.is_ascii_hexdigit()))
        .ok_or_else(|| {
            ApiError::from(Error::BadInput(
                "commit must be a 40-character hex string".to_string(),
            ))
        })?;
    Ok((repository, commit))
}

/// Normalize a dump root to `""` or a `dir/`-style prefix.
fn normalize_root(root: Option<&str>) -> String {
    let trimmed = root.unwrap_or("").trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
