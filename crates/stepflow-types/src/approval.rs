//! Human approval and webhook delivery types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context key under which approval decisions are written.
pub const APPROVALS_CONTEXT_KEY: &str = "_approvals";

/// Actor recorded when the timeout sweep expires an approval.
pub const SYSTEM_ACTOR: &str = "system";

/// Deterministic approval id for one visit of an approval state.
///
/// Redelivering the same step (same `seq`) yields the same id, so the row is
/// created at most once. A later visit of the state gets a fresh id.
pub fn approval_id(run_id: &Uuid, state_id: &str, seq: i64) -> String {
    format!("appr-{run_id}-{state_id}-{seq}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            "expired" => Ok(ApprovalStatus::Expired),
            other => Err(format!("unknown approval status '{other}'")),
        }
    }
}

/// A decision taken by a human (or the sweep).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn status(self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject => ApprovalStatus::Rejected,
        }
    }
}

/// A pending or decided human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    /// `appr-{run_id}-{state_id}-{seq}`.
    pub id: String,
    pub run_id: Uuid,
    pub state_id: String,
    pub message: String,
    /// Context path of the data the reviewer should look at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<String>,
    /// Allowed actors. Empty means anyone may decide.
    #[serde(default)]
    pub approvers: Vec<String>,
    pub status: ApprovalStatus,
    pub timeout_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    pub fn is_decided(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }

    /// True when `actor` may decide this approval.
    pub fn allows(&self, actor: &str) -> bool {
        self.approvers.is_empty() || self.approvers.iter().any(|a| a == actor)
    }
}

/// The `_approvals.<state id>` value written into the run context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub approved: bool,
    pub approver: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

/// Filter for approval listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApprovalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Webhook deliveries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}

/// One append-only entry of the webhook delivery log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub approval_id: String,
    pub attempt: u32,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempted_at: DateTime<Utc>,
}

/// Webhook payload sent when an approval is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequested {
    pub event: String,
    pub approval_id: String,
    pub run_id: Uuid,
    pub state_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<String>,
    pub approve_url: String,
    pub reject_url: String,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
}

impl ApprovalRequested {
    pub const EVENT: &'static str = "approval.requested";

    /// Build the payload, pointing the action links at `base_url`.
    pub fn new(approval: &Approval, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            event: Self::EVENT.to_string(),
            approval_id: approval.id.clone(),
            run_id: approval.run_id,
            state_id: approval.state_id.clone(),
            message: approval.message.clone(),
            summary_path: approval.summary_path.clone(),
            approve_url: format!("{base}/api/v1/approvals/{}/approve", approval.id),
            reject_url: format!("{base}/api/v1/approvals/{}/reject", approval.id),
            created_at: approval.created_at,
            timeout_at: approval.timeout_at,
        }
    }
}
