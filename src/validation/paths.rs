//! Path validation for conversion job arguments.

use std::path::Path;

use super::{ValidationIssue, ValidationResult};

/// Container extensions accepted as conversion input.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "webm", "mov"];

/// Validates the source and destination of a job.
pub fn validate_job(source: &Path, destination: &Path) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_source(source, &mut result);
    validate_destination(destination, &mut result);

    if same_file(source, destination) {
        result.add(ValidationIssue::error(
            "--output",
            "Input and output paths cannot be the same",
        ));
    }

    result
}

fn validate_source(source: &Path, result: &mut ValidationResult) {
    if !source.exists() {
        result.add(
            ValidationIssue::error(
                "--input",
                format!("Input file does not exist: '{}'", source.display()),
            )
            .with_suggestion("Check the path to the recording"),
        );
        return;
    }

    if !source.is_file() {
        result.add(ValidationIssue::error(
            "--input",
            format!("Input is not a file: '{}'", source.display()),
        ));
        return;
    }

    if !has_supported_extension(source) {
        result.add(
            ValidationIssue::error(
                "--input",
                format!("Unsupported input format: '{}'", source.display()),
            )
            .with_suggestion(format!("Supported extensions: {}", SUPPORTED_EXTENSIONS.join(", "))),
        );
    }

    if std::fs::File::open(source).is_err() {
        result.add(
            ValidationIssue::error(
                "--input",
                format!("Input file is not readable: '{}'", source.display()),
            )
            .with_suggestion("Check file permissions"),
        );
    }
}

fn validate_destination(destination: &Path, result: &mut ValidationResult) {
    if destination.is_dir() {
        result.add(ValidationIssue::error(
            "--output",
            format!("Output is a directory: '{}'", destination.display()),
        ));
        return;
    }

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    if !parent.is_dir() {
        result.add(
            ValidationIssue::error(
                "--output",
                format!("Output directory does not exist: '{}'", parent.display()),
            )
            .with_suggestion("Create the directory or choose another output path"),
        );
        return;
    }

    // Try to write a test file to check permissions
    let test_file = parent.join(".equirect_write_test");
    match std::fs::write(&test_file, "test") {
        Ok(()) => {
            let _ = std::fs::remove_file(&test_file);
        }
        Err(e) => {
            result.add(
                ValidationIssue::error(
                    "--output",
                    format!("Output directory is not writable '{}': {}", parent.display(), e),
                )
                .with_suggestion("Check directory permissions"),
            );
        }
    }

    if destination.extension().is_none() {
        result.add(ValidationIssue::warning(
            "--output",
            "Output has no extension; ffmpeg cannot infer a container",
        ));
    }
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Checks if two paths refer to the same file.
fn same_file(a: &Path, b: &Path) -> bool {
    let canon_a = std::fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let canon_b = std::fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    canon_a == canon_b
}
