//! Approval handlers: list, inspect, approve, reject and the webhook
//! delivery log.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use stepflow_types::approval::{Approval, Decision, DeliveryRecord};

use crate::http::error::AppError;
use crate::http::extractors::auth::Authenticated;
use crate::http::extractors::query::ApprovalListQuery;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Body of approve and reject requests. Reject accepts `reason` as an alias
/// of `comment`.
#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub actor: String,
    #[serde(default, alias = "reason")]
    pub comment: Option<String>,
}

/// Build the approval sub-router. Mounted at `/api/v1`.
pub fn approval_routes() -> Router<AppState> {
    Router::new()
        .route("/approvals", get(list_approvals))
        .route("/approvals/{id}", get(get_approval))
        .route("/approvals/{id}/approve", post(approve))
        .route("/approvals/{id}/reject", post(reject))
        .route("/approvals/{id}/deliveries", get(list_deliveries))
}

/// GET /api/v1/approvals - Pending approvals unless `?status=` says otherwise.
pub async fn list_approvals(
    State(state): State<AppState>,
    _auth: Authenticated,
    Query(query): Query<ApprovalListQuery>,
) -> Result<Json<ApiResponse<Vec<Approval>>>, AppError> {
    let start = Instant::now();
    let filter = query.into_filter()?;
    let approvals = state.approvals.list(&filter).await?;
    Ok(Json(ApiResponse::timed(approvals, start)))
}

/// GET /api/v1/approvals/{id}
pub async fn get_approval(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Approval>>, AppError> {
    let start = Instant::now();
    let approval = state.approvals.get(&id).await?;
    let run = format!("/api/v1/runs/{}", approval.run_id);
    Ok(Json(ApiResponse::timed(approval, start).with_link("run", &run)))
}

/// POST /api/v1/approvals/{id}/approve
pub async fn approve(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<ApiResponse<Approval>>, AppError> {
    decide(&state, &id, Decision::Approve, body).await
}

/// POST /api/v1/approvals/{id}/reject
pub async fn reject(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<ApiResponse<Approval>>, AppError> {
    decide(&state, &id, Decision::Reject, body).await
}

async fn decide(
    state: &AppState,
    id: &str,
    decision: Decision,
    body: DecisionBody,
) -> Result<Json<ApiResponse<Approval>>, AppError> {
    let start = Instant::now();
    let approval = state
        .approvals
        .decide(id, decision, &body.actor, body.comment)
        .await?;
    let run = format!("/api/v1/runs/{}", approval.run_id);
    Ok(Json(ApiResponse::timed(approval, start).with_link("run", &run)))
}

/// GET /api/v1/approvals/{id}/deliveries - Webhook attempts, oldest first.
pub async fn list_deliveries(
    State(state): State<AppState>,
    _auth: Authenticated,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<DeliveryRecord>>>, AppError> {
    let start = Instant::now();
    let deliveries = state.approvals.deliveries(&id).await?;
    Ok(Json(ApiResponse::timed(deliveries, start)))
}
