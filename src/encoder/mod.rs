//! Transcoder capability: per-unit projection conversion, probing and
//! concatenation.

pub mod concat;
pub mod ffmpeg;
pub mod process;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TranscodeError;
use crate::job::{JobId, ProjectionParams};
use crate::media::ProbeResult;
use crate::planner::TimeRange;

pub use ffmpeg::{FfmpegTranscoder, TranscoderSettings};

/// Everything the transcoder needs to produce one unit's partial artifact.
#[derive(Debug, Clone)]
pub struct UnitRequest {
    pub job_id: JobId,
    pub index: usize,
    pub range: TimeRange,
    pub source: PathBuf,
    pub projection: ProjectionParams,
    /// Where the transcoder writes while running.
    pub staging: PathBuf,
    /// Where a verified artifact is promoted to.
    pub artifact: PathBuf,
}

/// A verified media file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub duration_ms: u64,
    pub bytes: u64,
}

/// Result of one unit invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The artifact was written, sanity-checked and promoted.
    Success(ArtifactInfo),
    /// Eligible for retry (non-zero exit, killed, timeout, bad output).
    TransientFailure { reason: String },
    /// Not retried (unsupported input, missing encoder or filter).
    FatalFailure { reason: String },
    /// Stopped on request; the unit goes back to pending.
    Cancelled,
}

/// Opaque external transcoding capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Inspects a media file.
    async fn probe(&self, path: &Path) -> Result<ProbeResult, TranscodeError>;

    /// Converts one time range of the source into a partial artifact.
    ///
    /// The artifact is written to `request.staging` and renamed to
    /// `request.artifact` only after it passes the sanity check.
    async fn transcode_unit(&self, request: &UnitRequest, cancel: CancellationToken) -> UnitOutcome;

    /// Concatenates `parts` in order into `output` without re-encoding,
    /// using `list` as scratch space for the part list.
    async fn concatenate(
        &self,
        parts: &[PathBuf],
        list: &Path,
        output: &Path,
        cancel: CancellationToken,
    ) -> Result<(), TranscodeError>;
}

/// Expectations an artifact must meet to be trusted.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactCheck {
    pub expected_ms: u64,
    pub tolerance_ms: u64,
    pub min_bytes: u64,
}

/// Checks that an artifact exists, is large enough and has the expected
/// duration. Returns the reason on mismatch.
pub async fn verify_artifact(
    transcoder: &dyn Transcoder,
    path: &Path,
    check: &ArtifactCheck,
) -> Result<ArtifactInfo, String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("'{}' is not readable: {e}", path.display()))?;

    let bytes = metadata.len();
    if bytes < check.min_bytes.max(1) {
        return Err(format!(
            "'{}' is truncated ({} bytes)",
            path.display(),
            bytes
        ));
    }

    let probe = transcoder
        .probe(path)
        .await
        .map_err(|e| format!("'{}' could not be probed: {e}", path.display()))?;

    let duration_ms = probe.duration_ms();
    if duration_ms.abs_diff(check.expected_ms) > check.tolerance_ms {
        return Err(format!(
            "'{}' lasts {} ms, expected {} ms (tolerance {} ms)",
            path.display(),
            duration_ms,
            check.expected_ms,
            check.tolerance_ms
        ));
    }

    Ok(ArtifactInfo {
        path: path.to_path_buf(),
        duration_ms,
        bytes,
    })
}
