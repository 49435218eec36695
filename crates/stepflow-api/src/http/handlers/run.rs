//! Run control handlers: create, inspect, list, cancel, pause, resume.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use stepflow_core::service::run::{CreateRunRequest, RunDetail};
use stepflow_types::run::WorkflowRun;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::extractors::query::RunListQuery;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Optional body of `POST /runs/{id}/cancel`.
#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    pub reason: Option<String>,
}

/// Build the run sub-router. Mounted at `/api/v1`.
pub fn run_routes() -> Router<AppState> {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/pause", post(pause_run))
        .route("/runs/{id}/resume", post(resume_run))
}

fn run_link(run: &WorkflowRun) -> String {
    format!("/api/v1/runs/{}", run.id)
}

/// POST /api/v1/runs - Create a run and enqueue its start state.
pub async fn create_run(
    State(state): State<AppState>,
    _auth: Authenticated,
    Json(body): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowRun>>), AppError> {
    let start = Instant::now();
    let run = state.runs.create_run(body).await?;
    let link = run_link(&run);
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::timed(run, start).with_link("self", &link)),
    ))
}

/// GET /api/v1/runs - List runs, newest first.
pub async fn list_runs(
    State(state): State<AppState>,
    _auth: Authenticated,
    Query(query): Query<RunListQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowRun>>>, AppError> {
    let start = Instant::now();
    let filter = query.into_filter()?;
    let runs = state.runs.list_runs(&filter).await?;
    Ok(Json(ApiResponse::timed(runs, start)))
}

/// GET /api/v1/runs/{id} - Run with context and step history.
pub async fn get_run(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<RunDetail>>, AppError> {
    let start = Instant::now();
    let detail = state.runs.get_run(&id).await?;
    let approvals = format!("/api/v1/approvals?run_id={id}&status=all");
    Ok(Json(ApiResponse::timed(detail, start).with_link("approvals", &approvals)))
}

/// POST /api/v1/runs/{id}/cancel - Cancel a non-terminal run. Body `{reason?}`
/// is optional.
pub async fn cancel_run(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let body: CancelBody = if body.iter().all(u8::is_ascii_whitespace) {
        CancelBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid cancel body: {e}")))?
    };
    let run = state.runs.cancel_run(&id, body.reason).await?;
    Ok(Json(ApiResponse::timed(run, start)))
}

/// POST /api/v1/runs/{id}/pause
pub async fn pause_run(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let run = state.runs.pause_run(&id).await?;
    Ok(Json(ApiResponse::timed(run, start)))
}

/// POST /api/v1/runs/{id}/resume
pub async fn resume_run(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowRun>>, AppError> {
    let start = Instant::now();
    let run = state.runs.resume_run(&id).await?;
    Ok(Json(ApiResponse::timed(run, start)))
}
