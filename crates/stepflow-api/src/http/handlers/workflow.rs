//! Workflow definition handlers for the REST API.
//!
//! Definitions are accepted as JSON or YAML text. Publishing compiles the
//! definition and stores it as the next version; validation compiles only.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use stepflow_core::service::definition::parse_definition;
use stepflow_types::workflow::{ValidationIssue, WorkflowDefinition, WorkflowSummary};

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::extractors::query::VersionQuery;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Result of a compile-only validation.
#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

/// Build the workflow sub-router. Mounted at `/api/v1`.
pub fn workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows", post(publish_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/validate", post(validate_workflow))
}

/// POST /api/v1/workflows - Publish a new definition version.
pub async fn publish_workflow(
    State(state): State<AppState>,
    _auth: Authenticated,
    body: String,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowDefinition>>), AppError> {
    let start = Instant::now();

    let def = parse_definition(&body)?;
    let stored = state.definitions.publish(def).await?;
    let self_link = format!("/api/v1/workflows/{}?version={}", stored.id, stored.version);

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::timed(stored, start).with_link("self", &self_link)),
    ))
}

/// GET /api/v1/workflows - Latest version of every workflow.
pub async fn list_workflows(
    State(state): State<AppState>,
    _auth: Authenticated,
) -> Result<Json<ApiResponse<Vec<WorkflowSummary>>>, AppError> {
    let start = Instant::now();
    let workflows = state.definitions.list().await?;
    Ok(Json(ApiResponse::timed(workflows, start)))
}

/// GET /api/v1/workflows/{id} - Latest version, or `?version=n`.
pub async fn get_workflow(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let def = state.definitions.get(&id, query.version).await?;
    Ok(Json(
        ApiResponse::timed(def, start).with_link("runs", &format!("/api/v1/runs?workflow_id={id}")),
    ))
}

/// POST /api/v1/workflows/{id}/validate - Compile without storing.
pub async fn validate_workflow(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<String>,
    body: String,
) -> Result<Json<ApiResponse<ValidationReport>>, AppError> {
    let start = Instant::now();

    let mut def = parse_definition(&body)?;
    if def.id.is_empty() {
        def.id = id;
    }
    let issues = state.definitions.validate(&def);

    Ok(Json(ApiResponse::timed(
        ValidationReport {
            valid: issues.is_empty(),
            issues,
        },
        start,
    )))
}
