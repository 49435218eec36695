//! Liveness endpoint. Not authenticated.

use std::time::Instant;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub database: bool,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<Health>> {
    let start = Instant::now();
    let database = database_reachable(&state).await;
    Json(ApiResponse::timed(
        Health {
            status: if database { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            database,
        },
        start,
    ))
}

async fn database_reachable(state: &AppState) -> bool {
    match state.db_pool.reader.acquire().await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "health check could not reach the database");
            false
        }
    }
}
