//! HTTP surface for submitting and inspecting sync jobs.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::jobs::{self, JobError};
use crate::keep::KeepService;
use crate::model::{JobStatus, SyncJob};
use crate::notion::NotionService;
use crate::runner::{RunnerHandle, SyncTask};

pub struct AppState {
    pub pool: Pool,
    pub runner: RunnerHandle,
    pub keep: Arc<dyn KeepService>,
    pub notion: Arc<dyn NotionService>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/internal/sync/execute", post(execute_sync))
        .route("/internal/sync/status/{job_id}", get(sync_status))
        .route("/internal/sync/abort/{job_id}", post(abort_sync))
        .route("/internal/sync/jobs", get(list_jobs))
        .route("/internal/sync/logs/{job_id}", get(job_logs))
        .with_state(Arc::new(state))
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Sync Service",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (database, keep, notion) = future::join3(
        check_database(&state.pool),
        state.keep.health(),
        state.notion.health(),
    )
    .await;
    let healthy = database.is_ok() && keep.is_ok() && notion.is_ok();

    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "service": "sync_service",
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "database": dependency_state(&database),
            "keep_extractor": dependency_state(&keep),
            "notion_writer": dependency_state(&notion),
        },
    }))
}

async fn check_database(pool: &Pool) -> anyhow::Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

fn dependency_state<T>(result: &anyhow::Result<T>) -> &'static str {
    if result.is_ok() {
        "up"
    } else {
        "down"
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    user_id: String,
    #[serde(default)]
    full_sync: bool,
    #[serde(default)]
    job_id: Option<String>,
}

async fn execute_sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> Response {
    if req.user_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "user_id must not be empty");
    }
    let job_id = match req.job_id.as_deref() {
        Some(raw) => match raw.parse::<Uuid>() {
            Ok(id) => id,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid job_id format"),
        },
        None => Uuid::new_v4(),
    };

    // Resubmitting a known job id reports the row instead of queueing twice.
    match db::get_sync_job(&state.pool, job_id).await {
        Ok(Some(existing)) => {
            return (
                StatusCode::OK,
                Json(json!({
                    "job_id": existing.job_id,
                    "status": existing.status,
                    "message": "Sync job already exists",
                })),
            )
                .into_response();
        }
        Ok(None) => {}
        Err(err) => return store_error(err),
    }

    if let Err(err) = db::create_sync_job(&state.pool, job_id, &req.user_id, req.full_sync).await {
        return store_error(err);
    }
    match state.runner.submit(SyncTask {
        job_id,
        user_id: req.user_id.clone(),
        full_sync: req.full_sync,
    }) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "job_id": job_id,
                "status": "queued",
                "message": "Sync job queued successfully",
            })),
        )
            .into_response(),
        Err(err) => {
            // The row exists but will never be picked up, so close it out.
            let detail = err.to_string();
            if let Err(store_err) =
                db::finalize_sync_job(&state.pool, job_id, JobStatus::Failed, Some(&detail)).await
            {
                error!(%job_id, error = %format!("{store_err:#}"), "failed to close out unqueued job");
            }
            error_response(StatusCode::SERVICE_UNAVAILABLE, &detail)
        }
    }
}

async fn sync_status(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let Ok(job_id) = job_id.parse::<Uuid>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid job_id format");
    };
    match jobs::job_status(&state.pool, job_id).await {
        Ok(job) => (StatusCode::OK, Json(job_json(&job))).into_response(),
        Err(err) => job_error_response(err),
    }
}

async fn abort_sync(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let Ok(job_id) = job_id.parse::<Uuid>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid job_id format");
    };
    match jobs::abort_job(&state.pool, state.runner.registry(), job_id).await {
        Ok(job) => (
            StatusCode::OK,
            Json(json!({
                "job_id": job.job_id,
                "status": job.status,
                "message": "Sync job has been cancelled",
            })),
        )
            .into_response(),
        Err(err) => job_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    user_id: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_jobs(State(state): State<Arc<AppState>>, Query(query): Query<JobsQuery>) -> Response {
    let Some(user_id) = query.user_id.filter(|u| !u.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "user_id query parameter is required");
    };
    let (limit, offset) = page_params(query.limit, query.offset);
    match db::list_sync_jobs(&state.pool, &user_id, limit, offset).await {
        Ok(jobs) => {
            let jobs: Vec<Value> = jobs.iter().map(job_json).collect();
            (
                StatusCode::OK,
                Json(json!({ "count": jobs.len(), "jobs": jobs })),
            )
                .into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn job_logs(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let Ok(job_id) = job_id.parse::<Uuid>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid job_id format");
    };
    if let Err(err) = jobs::job_status(&state.pool, job_id).await {
        return job_error_response(err);
    }
    match db::list_sync_logs(&state.pool, job_id, 100).await {
        Ok(entries) => {
            let logs: Vec<Value> = entries
                .iter()
                .map(|entry| {
                    json!({
                        "id": entry.id,
                        "keep_note_id": entry.keep_note_id,
                        "level": entry.level,
                        "message": entry.message,
                        "created_at": entry.created_at.to_rfc3339(),
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({ "job_id": job_id, "logs": logs })),
            )
                .into_response()
        }
        Err(err) => store_error(err),
    }
}

fn page_params(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (limit.unwrap_or(20).clamp(1, 100), offset.unwrap_or(0).max(0))
}

fn job_json(job: &SyncJob) -> Value {
    json!({
        "job_id": job.job_id,
        "status": job.status,
        "full_sync": job.full_sync,
        "progress": {
            "total_notes": job.total_notes,
            "processed_notes": job.processed_notes,
            "failed_notes": job.failed_notes,
        },
        "created_at": job.created_at.to_rfc3339(),
        "completed_at": job.completed_at.map(|t| t.to_rfc3339()),
        "error_message": job.error_message,
    })
}

fn job_error_response(err: JobError) -> Response {
    match err {
        JobError::NotFound(job_id) => error_response(
            StatusCode::NOT_FOUND,
            &format!("Sync job {job_id} not found"),
        ),
        JobError::InvalidState { status } => error_response(
            StatusCode::BAD_REQUEST,
            &format!("Cannot abort job with status '{status}'"),
        ),
        JobError::Store(err) => store_error(err),
    }
}

fn store_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "store operation failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}
