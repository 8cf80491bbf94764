//! Assembles done units into the output artifact.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{FailureAction, RetryPolicy};
use crate::encoder::{verify_artifact, ArtifactCheck, ArtifactInfo, Transcoder};
use crate::error::{EngineError, TranscodeError};
use crate::job::{paths::output_staging, JobPaths};
use crate::store::ProgressRecord;

/// Result of a finalization attempt.
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// The output was written, verified and moved into place.
    Assembled(ArtifactInfo),
    /// Cancellation stopped the concatenation; units remain done.
    Cancelled,
}

/// Concatenates the record's artifacts in time order and promotes the
/// verified result to the destination.
///
/// A concatenation that fails transiently is retried within `retry`.
pub async fn assemble(
    record: &ProgressRecord,
    paths: &JobPaths,
    transcoder: &dyn Transcoder,
    retry: RetryPolicy,
    tolerance_ms: u64,
    min_bytes: u64,
    cancel: CancellationToken,
) -> Result<FinalizeOutcome, EngineError> {
    if !record.all_done() {
        return Err(EngineError::Internal(format!(
            "job {} has unfinished units at finalization",
            record.job.id
        )));
    }

    let mut units: Vec<_> = record.units.iter().collect();
    units.sort_by_key(|u| u.index);
    let parts: Vec<PathBuf> = units.iter().map(|u| u.artifact.clone()).collect();

    let destination = &record.job.destination;
    let staging = output_staging(destination);
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::Internal(format!("cannot create '{}': {e}", parent.display())))?;
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match transcoder
            .concatenate(&parts, &paths.concat_list(), &staging, cancel.clone())
            .await
        {
            Ok(()) => break,
            Err(err) => err,
        };
        remove_quietly(&staging).await;

        if matches!(err, TranscodeError::Cancelled) {
            return Ok(FinalizeOutcome::Cancelled);
        }
        if err.is_fatal() {
            return Err(EngineError::Fatal {
                unit: None,
                message: format!("concatenation failed: {err}"),
            });
        }

        let reason = err.to_string();
        match retry.on_transient(attempts, &reason) {
            FailureAction::Retrying { attempt, max_attempts } => {
                warn!(job_id = %record.job.id, attempt, max_attempts, reason = %reason, "Concatenation failed, retrying");
            }
            FailureAction::Exhausted { .. } => {
                return Err(EngineError::ConcatExhausted {
                    attempts,
                    last_error: reason,
                });
            }
        }
    }

    let check = ArtifactCheck {
        expected_ms: record.source_duration_ms,
        tolerance_ms,
        min_bytes,
    };
    let info = match verify_artifact(transcoder, &staging, &check).await {
        Ok(info) => info,
        Err(message) => {
            remove_quietly(&staging).await;
            return Err(EngineError::Verification { message });
        }
    };

    tokio::fs::rename(&staging, destination).await.map_err(|e| {
        EngineError::Internal(format!(
            "failed to move output into '{}': {e}",
            destination.display()
        ))
    })?;

    info!(
        job_id = %record.job.id,
        output = ?destination,
        duration_ms = info.duration_ms,
        bytes = info.bytes,
        "Output assembled"
    );

    Ok(FinalizeOutcome::Assembled(ArtifactInfo {
        path: destination.clone(),
        ..info
    }))
}

/// Removes a job's partial artifacts. Failure is logged, never fatal.
pub async fn cleanup(paths: &JobPaths) {
    match tokio::fs::remove_dir_all(paths.work_dir()).await {
        Ok(()) => debug!(dir = ?paths.work_dir(), "Removed partial artifacts"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = ?paths.work_dir(), error = %e, "Failed to remove partial artifacts"),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = ?path, error = %e, "Failed to remove output staging file");
        }
    }
}
