//! Engine configuration loader for Stepflow.
//!
//! Reads `config.toml` from the data directory (`~/.stepflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to sensible defaults
//! when the file is missing or malformed.

use std::path::Path;

use stepflow_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config
///   with out-of-range values clamped.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Clamp values that would stall the engine.
fn sanitize(mut config: EngineConfig) -> EngineConfig {
    config.scheduler.workers = config.scheduler.workers.max(1);
    config.scheduler.lease_secs = config.scheduler.lease_secs.max(1);
    config.approvals.sweep_interval_secs = config.approvals.sweep_interval_secs.max(1);
    config.notifier.max_attempts = config.notifier.max_attempts.max(1);
    if config.notifier.enabled && config.notifier.url.is_none() {
        tracing::warn!("notifier is enabled but has no url, disabling it");
        config.notifier.enabled = false;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.scheduler.workers, 4);
        assert!(!config.notifier.enabled);
    }

    #[tokio::test]
    async fn test_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[scheduler]
workers = 2
poll_interval_ms = 50

[approvals]
public_base_url = "https://flow.example.com"

[notifier]
enabled = true
url = "https://hooks.example.com/approvals"
max_attempts = 5
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.scheduler.workers, 2);
        assert_eq!(config.scheduler.poll_interval_ms, 50);
        assert_eq!(config.approvals.public_base_url, "https://flow.example.com");
        assert!(config.notifier.enabled);
        assert_eq!(config.notifier.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.approvals.default_timeout_secs, 3600);
    }

    #[tokio::test]
    async fn test_out_of_range_values_are_clamped() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "[scheduler]\nworkers = 0\n\n[notifier]\nenabled = true\nmax_attempts = 0\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.scheduler.workers, 1);
        assert_eq!(config.notifier.max_attempts, 1);
        assert!(!config.notifier.enabled, "enabled without url is disabled");
    }
}
