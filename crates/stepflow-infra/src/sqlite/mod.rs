//! SQLite storage layer.
//!
//! Repository and queue implementations backed by SQLite with WAL mode and
//! split read/write connection pools. Multi-row writes (step commits,
//! approval decisions, run transitions) run in a single writer transaction.

pub mod approval;
pub mod pool;
pub mod queue;
pub mod workflow;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stepflow_types::error::RepositoryError;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Column helpers shared by the repositories
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps, so text comparison in SQL matches time order.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

/// Text form of a snake_case serde enum.
pub(crate) fn enum_to_column<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("not a text enum: {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

pub(crate) fn enum_from_column<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

pub(crate) fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_types::run::StepStatus;

    #[test]
    fn test_datetime_format_sorts_as_text() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:09.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T00:00:10Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(format_datetime(&early) < format_datetime(&late));
        assert_eq!(parse_datetime(&format_datetime(&late)).unwrap(), late);
    }

    #[test]
    fn test_enum_columns() {
        assert_eq!(enum_to_column(&StepStatus::WaitingApproval).unwrap(), "waiting_approval");
        let status: StepStatus = enum_from_column("failed", "step status").unwrap();
        assert_eq!(status, StepStatus::Failed);
        assert!(enum_from_column::<StepStatus>("nope", "step status").is_err());
    }
}
