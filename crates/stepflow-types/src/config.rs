//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory that
//! controls scheduler workers, approval timeouts, the webhook notifier and the
//! expression budget.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine.
///
/// Loaded from `{data_dir}/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub expressions: ExpressionLimits,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent consumer workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Back-off between dequeue attempts when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Visibility timeout of a dequeued work item.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Timeout applied to operation states that do not declare one.
    #[serde(default = "default_operation_timeout_secs")]
    pub default_operation_timeout_secs: u64,
    /// Runs idle longer than this are not re-enqueued on startup.
    #[serde(default = "default_max_recovery_age_secs")]
    pub max_recovery_age_secs: u64,
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_lease_secs() -> u64 {
    300
}

fn default_operation_timeout_secs() -> u64 {
    300
}

fn default_max_recovery_age_secs() -> u64 {
    4 * 60 * 60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            default_operation_timeout_secs: default_operation_timeout_secs(),
            max_recovery_age_secs: default_max_recovery_age_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Timeout for approvals whose input omits `timeout_seconds`.
    #[serde(default = "default_approval_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Interval of the expiry sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Base URL used to build approve/reject links in notifications.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_approval_timeout_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_approval_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            public_base_url: default_public_base_url(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Outbound webhook settings for approval notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_notifier_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_notifier_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_notifier_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_notifier_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// HMAC-SHA256 signing secret. No signature header when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_notifier_timeout_secs() -> u64 {
    10
}

fn default_notifier_max_attempts() -> u32 {
    3
}

fn default_notifier_initial_backoff_ms() -> u64 {
    500
}

fn default_notifier_max_backoff_ms() -> u64 {
    30_000
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            timeout_secs: default_notifier_timeout_secs(),
            max_attempts: default_notifier_max_attempts(),
            initial_backoff_ms: default_notifier_initial_backoff_ms(),
            max_backoff_ms: default_notifier_max_backoff_ms(),
            secret: None,
            headers: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Resource budget enforced before an expression is evaluated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExpressionLimits {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_length() -> usize {
    4096
}

fn default_max_depth() -> usize {
    32
}

impl Default for ExpressionLimits {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            max_depth: default_max_depth(),
        }
    }
}
