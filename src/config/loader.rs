//! Configuration file loading and parsing.

use std::path::Path;

use anyhow::{Context, Result};

use super::model::AppConfig;
use crate::error::ConfigError;
use crate::validation::{report, validate_config, SystemCapabilities};

/// Loads the configuration file from disk and parses it.
pub fn load_from_path(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: AppConfig =
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(config)
}

/// Loads the configuration file, falling back to defaults when `optional`
/// is set and the file does not exist.
pub fn load_or_default(path: &Path, optional: bool) -> Result<AppConfig, ConfigError> {
    if optional && !path.exists() {
        tracing::debug!(path = ?path, "No config file, using defaults");
        return Ok(AppConfig::default());
    }
    load_from_path(path)
}

/// Validates a configuration, logging warnings and rejecting errors.
pub fn ensure_valid(config: &AppConfig, capabilities: Option<&SystemCapabilities>) -> Result<()> {
    let result = validate_config(config, capabilities);

    for issue in result.warnings() {
        tracing::warn!(
            path = %issue.path,
            message = %issue.message,
            suggestion = ?issue.suggestion,
            "Config validation warning"
        );
    }

    if result.error_count() > 0 {
        tracing::error!("{}", report::format_report(&result));
        anyhow::bail!(ConfigError::ValidationFailed {
            error_count: result.error_count()
        });
    }

    Ok(())
}

/// Loads and fully validates the configuration file.
pub fn load_and_validate(
    path: &Path,
    optional: bool,
    capabilities: Option<&SystemCapabilities>,
) -> Result<AppConfig> {
    let config = load_or_default(path, optional).context("Failed to load configuration")?;
    ensure_valid(&config, capabilities)?;
    Ok(config)
}
