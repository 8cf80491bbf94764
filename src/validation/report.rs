//! Validation report formatting.

use std::fmt::Write;

use super::{ValidationIssue, ValidationResult, ValidationSeverity};

/// Formats every issue, errors first, followed by a summary line.
pub fn format_report(result: &ValidationResult) -> String {
    let mut report = String::new();
    for issue in result.errors().chain(result.warnings()) {
        report.push_str(&format_issue(issue));
    }
    report.push_str(&format_brief_summary(result));
    report.push('\n');
    report
}

/// Formats one issue as `error[path]: message` with an optional help line.
fn format_issue(issue: &ValidationIssue) -> String {
    let label = match issue.severity {
        ValidationSeverity::Error => "error",
        ValidationSeverity::Warning => "warning",
    };

    let mut out = String::new();
    let _ = writeln!(out, "{label}[{}]: {}", issue.path, issue.message);
    if let Some(suggestion) = &issue.suggestion {
        let _ = writeln!(out, "  help: {suggestion}");
    }
    out
}

/// Formats a one-line summary.
pub fn format_brief_summary(result: &ValidationResult) -> String {
    let errors = result.error_count();
    let warnings = result.warnings().count();

    match (errors, warnings) {
        (0, 0) => "No issues found".to_string(),
        (0, w) => format!("Passed with {w} warning(s)"),
        (e, w) => format!("Failed: {e} error(s), {w} warning(s)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_lists_errors_before_warnings() {
        let mut result = ValidationResult::new();
        result.add(ValidationIssue::warning("transcoder.preset", "Unknown encoder preset"));
        result.add(
            ValidationIssue::error("retry.max_attempts", "Max attempts must be at least 1")
                .with_suggestion("Use 1 to disable retries"),
        );

        let report = format_report(&result);
        assert_eq!(
            report,
            "error[retry.max_attempts]: Max attempts must be at least 1\n\
             \x20 help: Use 1 to disable retries\n\
             warning[transcoder.preset]: Unknown encoder preset\n\
             Failed: 1 error(s), 1 warning(s)\n"
        );
    }

    #[test]
    fn clean_result_is_a_single_line() {
        assert_eq!(format_report(&ValidationResult::new()), "No issues found\n");
    }
}
