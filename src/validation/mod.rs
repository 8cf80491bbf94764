//! Configuration, job and toolchain validation.

pub mod codec;
pub mod paths;
pub mod report;
pub mod semantic;

use std::collections::HashSet;
use std::path::Path;

use crate::config::model::AppConfig;
use crate::error::CapabilityError;

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// Blocks the operation.
    Error,
    /// Logged but allows the operation.
    Warning,
}

/// A validation issue found while checking configuration or job arguments.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue.
    pub severity: ValidationSeverity,
    /// Config field or argument at fault (e.g., "retry.max_attempts", "--input").
    pub path: String,
    /// Description of the issue.
    pub message: String,
    /// Optional suggestion for fixing the issue.
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Creates a new error-level validation issue.
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Error,
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Creates a new warning-level validation issue.
    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ValidationSeverity::Warning,
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Adds a suggestion to this validation issue.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Collected validation issues.
#[derive(Debug, Default)]
pub struct ValidationResult {
    issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// Extends the result with issues from another result.
    pub fn extend(&mut self, other: ValidationResult) {
        self.issues.extend(other.issues);
    }

    /// Returns true if there are no errors (warnings are allowed).
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == ValidationSeverity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Warning)
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }
}

/// Encoders and filters offered by the installed ffmpeg.
#[derive(Debug, Clone, Default)]
pub struct SystemCapabilities {
    /// Available FFmpeg encoders.
    pub available_encoders: HashSet<String>,
    /// Available FFmpeg filters.
    pub available_filters: HashSet<String>,
}

impl SystemCapabilities {
    /// Detects capabilities by querying `ffmpeg -encoders` and `ffmpeg -filters`.
    pub fn detect(ffmpeg: &Path) -> Result<Self, CapabilityError> {
        Ok(Self {
            available_encoders: parse_ffmpeg_list(&query_ffmpeg(ffmpeg, "-encoders")?),
            available_filters: parse_ffmpeg_list(&query_ffmpeg(ffmpeg, "-filters")?),
        })
    }
}

/// Runs `ffmpeg <flag> -hide_banner` and returns its stdout.
fn query_ffmpeg(ffmpeg: &Path, flag: &str) -> Result<String, CapabilityError> {
    let command = format!("{} {}", ffmpeg.display(), flag);
    let output = std::process::Command::new(ffmpeg)
        .args([flag, "-hide_banner"])
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CapabilityError::ToolNotFound {
                tool: ffmpeg.display().to_string(),
            },
            _ => CapabilityError::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            },
        })?;

    if !output.status.success() {
        return Err(CapabilityError::CommandFailed {
            command,
            message: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses the name column of `ffmpeg -encoders` / `ffmpeg -filters` output.
///
/// Entries look like ` V....D libx265   ...` or ` TSC v360   V->V   ...`;
/// the legend above the ` ------` separator is skipped.
pub fn parse_ffmpeg_list(output: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut in_body = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("---") {
            in_body = true;
            continue;
        }
        if !in_body || trimmed.is_empty() {
            continue;
        }

        let mut parts = trimmed.split_whitespace();
        if let (Some(_flags), Some(name)) = (parts.next(), parts.next()) {
            names.insert(name.to_string());
        }
    }

    names
}

/// Validates the configuration, checking against system capabilities when
/// they are known.
pub fn validate_config(
    config: &AppConfig,
    capabilities: Option<&SystemCapabilities>,
) -> ValidationResult {
    let mut result = ValidationResult::new();

    result.extend(semantic::validate(config));
    if let Some(capabilities) = capabilities {
        result.extend(codec::validate(config, capabilities));
    }

    result
}

/// Validates the arguments of a conversion job.
pub fn validate_job(source: &Path, destination: &Path) -> ValidationResult {
    paths::validate_job(source, destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS: &str = "Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (codec h264)
 V....D libx265              libx265 H.265 / HEVC (codec hevc)
 A....D aac                  AAC (Advanced Audio Coding)
";

    const FILTERS: &str = "Filters:
  T.. = Timeline support
  ------
 TSC v360              V->V       Convert 360 projection of video.
 ... scale             V->V       Scale the input video size and/or convert the image format.
";

    #[test]
    fn parses_encoder_names() {
        let names = parse_ffmpeg_list(ENCODERS);
        assert!(names.contains("libx265"));
        assert!(names.contains("aac"));
        assert!(!names.contains("="));
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn parses_filter_names() {
        let names = parse_ffmpeg_list(FILTERS);
        assert!(names.contains("v360"));
        assert!(names.contains("scale"));
    }

    #[test]
    fn default_config_is_valid_without_capabilities() {
        let result = validate_config(&AppConfig::default(), None);
        assert!(result.is_valid());
    }
}
