//! Query parameter extractors for list endpoints.

use serde::Deserialize;
use stepflow_types::approval::{ApprovalFilter, ApprovalStatus};
use stepflow_types::run::{RunFilter, RunStatus};
use uuid::Uuid;

use crate::http::error::AppError;

/// Query parameters for `GET /runs`.
#[derive(Debug, Deserialize, Default)]
pub struct RunListQuery {
    pub workflow_id: Option<String>,
    /// One of the run statuses, e.g. `waiting_approval`.
    pub status: Option<String>,
    /// Maximum results (default 50, capped at 500).
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl RunListQuery {
    pub fn into_filter(self) -> Result<RunFilter, AppError> {
        let status = self
            .status
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<RunStatus>())
            .transpose()
            .map_err(AppError::BadRequest)?;
        Ok(RunFilter {
            workflow_id: self.workflow_id.filter(|w| !w.is_empty()),
            status,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// Query parameters for `GET /approvals`.
#[derive(Debug, Deserialize, Default)]
pub struct ApprovalListQuery {
    /// Defaults to `pending`; `all` disables the status filter.
    pub status: Option<String>,
    pub run_id: Option<Uuid>,
    pub limit: Option<u32>,
}

impl ApprovalListQuery {
    pub fn into_filter(self) -> Result<ApprovalFilter, AppError> {
        let status = match self.status.as_deref() {
            None | Some("") => Some(ApprovalStatus::Pending),
            Some("all") => None,
            Some(s) => Some(s.parse::<ApprovalStatus>().map_err(AppError::BadRequest)?),
        };
        Ok(ApprovalFilter {
            status,
            run_id: self.run_id,
            limit: self.limit,
        })
    }
}

/// Query parameters for `GET /workflows/{id}`.
#[derive(Debug, Deserialize, Default)]
pub struct VersionQuery {
    pub version: Option<i64>,
}
