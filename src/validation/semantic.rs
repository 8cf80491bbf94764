//! Semantic validation for configuration values.

use crate::config::model::AppConfig;

use super::{ValidationIssue, ValidationResult};

/// Valid log levels.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid x264/x265 presets.
const VALID_PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower",
    "veryslow", "placebo",
];

/// Shortest chunk the concat demuxer handles cleanly.
const MIN_CHUNK_SECONDS: f64 = 1.0;

/// Validates semantic correctness of configuration values.
pub fn validate(config: &AppConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if !VALID_LOG_LEVELS.contains(&config.global.log_level.as_str()) {
        result.add(
            ValidationIssue::error(
                "global.log_level",
                format!("Invalid log level: '{}'", config.global.log_level),
            )
            .with_suggestion(format!("Valid levels: {}", VALID_LOG_LEVELS.join(", "))),
        );
    }

    let transcoder = &config.transcoder;
    if transcoder.crf > 51 {
        result.add(
            ValidationIssue::error(
                "transcoder.crf",
                format!("CRF {} is out of range", transcoder.crf),
            )
            .with_suggestion("CRF must be between 0 and 51"),
        );
    }
    if let Some(preset) = &transcoder.preset {
        if !VALID_PRESETS.contains(&preset.as_str()) {
            result.add(
                ValidationIssue::warning(
                    "transcoder.preset",
                    format!("Unknown encoder preset: '{}'", preset),
                )
                .with_suggestion(format!("Common presets: {}", VALID_PRESETS.join(", "))),
            );
        }
    }
    if transcoder.timeout_seconds == Some(0) {
        result.add(ValidationIssue::error(
            "transcoder.timeout_seconds",
            "Timeout must be at least 1 second; omit it for no limit",
        ));
    }

    if !(1..=360).contains(&config.projection.fov) {
        result.add(ValidationIssue::error(
            "projection.fov",
            format!("Field of view {} is out of range (1-360)", config.projection.fov),
        ));
    }

    if let Some(seconds) = config.chunking.chunk_seconds {
        if !seconds.is_finite() || seconds <= 0.0 {
            result.add(
                ValidationIssue::error(
                    "chunking.chunk_seconds",
                    format!("Chunk length must be positive, got {}", seconds),
                )
                .with_suggestion("Use null to convert the whole file as one unit"),
            );
        } else if seconds < MIN_CHUNK_SECONDS {
            result.add(ValidationIssue::warning(
                "chunking.chunk_seconds",
                format!("Chunk length {} s is very short; expect many tiny units", seconds),
            ));
        }
    }

    if config.concurrency.workers_per_job == 0 {
        result.add(ValidationIssue::error(
            "concurrency.workers_per_job",
            "Workers must be at least 1",
        ));
    }
    if config.concurrency.max_concurrent_jobs == 0 {
        result.add(ValidationIssue::error(
            "concurrency.max_concurrent_jobs",
            "At least one job must be allowed to run",
        ));
    }

    if config.retry.max_attempts == 0 {
        result.add(
            ValidationIssue::error("retry.max_attempts", "Max attempts must be at least 1")
                .with_suggestion("Use 1 to disable retries"),
        );
    }

    if config.verification.min_artifact_bytes == 0 {
        result.add(ValidationIssue::warning(
            "verification.min_artifact_bytes",
            "Empty artifacts are never accepted; treating 0 as 1",
        ));
    }

    if config.prometheus.enabled && config.prometheus.port == 0 {
        result.add(ValidationIssue::error(
            "prometheus.port",
            "Prometheus port cannot be 0",
        ));
    }

    result
}
