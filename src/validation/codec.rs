//! Codec and filter availability validation.

use std::collections::HashSet;

use crate::config::model::AppConfig;

use super::{SystemCapabilities, ValidationIssue, ValidationResult};

/// Filter performing the projection mapping.
pub const PROJECTION_FILTER: &str = "v360";

/// Validates that the configured encoders and the projection filter exist.
pub fn validate(config: &AppConfig, capabilities: &SystemCapabilities) -> ValidationResult {
    let mut result = ValidationResult::new();

    let video = &config.transcoder.video_codec;
    if !capabilities.available_encoders.contains(video) {
        result.add(
            ValidationIssue::error(
                "transcoder.video_codec",
                format!("Video encoder '{}' is not available", video),
            )
            .with_suggestion(suggest(
                &["libx265", "libx264", "hevc_nvenc", "hevc_videotoolbox"],
                &capabilities.available_encoders,
            )),
        );
    }

    let audio = &config.transcoder.audio_codec;
    if audio != "copy" && !capabilities.available_encoders.contains(audio) {
        result.add(
            ValidationIssue::error(
                "transcoder.audio_codec",
                format!("Audio encoder '{}' is not available", audio),
            )
            .with_suggestion(suggest(
                &["aac", "libopus", "ac3", "copy"],
                &capabilities.available_encoders,
            )),
        );
    }

    if !capabilities.available_filters.contains(PROJECTION_FILTER) {
        result.add(
            ValidationIssue::error(
                "transcoder.ffmpeg_path",
                format!("ffmpeg has no '{}' filter", PROJECTION_FILTER),
            )
            .with_suggestion("Install an ffmpeg build with v360 support (4.3 or newer)"),
        );
    }

    result
}

/// Suggests alternatives from `candidates` that are actually installed.
fn suggest(candidates: &[&str], available: &HashSet<String>) -> String {
    let found: Vec<&str> = candidates
        .iter()
        .filter(|c| **c == "copy" || available.contains(**c))
        .copied()
        .collect();

    if found.is_empty() {
        "No common alternatives available".to_string()
    } else {
        format!("Available alternatives: {}", found.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(encoders: &[&str], filters: &[&str]) -> SystemCapabilities {
        SystemCapabilities {
            available_encoders: encoders.iter().map(|s| s.to_string()).collect(),
            available_filters: filters.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn complete_toolchain_passes() {
        let caps = capabilities(&["libx265", "aac"], &["v360"]);
        assert!(validate(&AppConfig::default(), &caps).is_valid());
    }

    #[test]
    fn missing_encoder_suggests_installed_ones() {
        let caps = capabilities(&["libx264", "aac"], &["v360"]);
        let result = validate(&AppConfig::default(), &caps);
        let issue = result.errors().next().unwrap();
        assert_eq!(issue.path, "transcoder.video_codec");
        assert_eq!(
            issue.suggestion.as_deref(),
            Some("Available alternatives: libx264")
        );
    }

    #[test]
    fn missing_v360_is_an_error() {
        let caps = capabilities(&["libx265", "aac"], &["scale"]);
        let result = validate(&AppConfig::default(), &caps);
        assert_eq!(result.error_count(), 1);
    }
}
