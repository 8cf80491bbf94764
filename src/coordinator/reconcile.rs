//! Reconciles a loaded progress record with the files actually on disk.

use tracing::{debug, info, warn};

use crate::encoder::{verify_artifact, ArtifactCheck, Transcoder};
use crate::job::JobPaths;
use crate::planner::UnitStatus;
use crate::store::ProgressRecord;

/// What reconciliation changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Units found in progress, left over from an interrupted run.
    pub interrupted: Vec<usize>,
    /// Done units whose artifact was missing or failed verification.
    pub unverified: Vec<usize>,
    /// Done units whose artifact is reused as-is.
    pub reused: Vec<usize>,
    /// Leftover staging files removed.
    pub staging_removed: usize,
}

impl ReconcileReport {
    /// True if any unit changed status.
    pub fn changed(&self) -> bool {
        !self.interrupted.is_empty() || !self.unverified.is_empty()
    }
}

/// Demotes every unit whose recorded status cannot be trusted.
///
/// In-progress units always go back to pending. Done units keep their status
/// only if their artifact exists, is at least `min_bytes` long and probes to
/// the unit's length within `tolerance_ms`.
pub async fn reconcile(
    record: &mut ProgressRecord,
    paths: &JobPaths,
    transcoder: &dyn Transcoder,
    tolerance_ms: u64,
    min_bytes: u64,
) -> ReconcileReport {
    let mut report = ReconcileReport {
        staging_removed: remove_staging_files(paths).await,
        ..ReconcileReport::default()
    };

    for unit in record.units.iter_mut() {
        match unit.status {
            UnitStatus::InProgress => {
                // the interrupted attempt never finished; it is not charged
                unit.status = UnitStatus::Pending;
                unit.attempts = unit.attempts.saturating_sub(1);
                report.interrupted.push(unit.index);
            }
            UnitStatus::Done => {
                let check = ArtifactCheck {
                    expected_ms: unit.range.len_ms(),
                    tolerance_ms,
                    min_bytes,
                };
                match verify_artifact(transcoder, &unit.artifact, &check).await {
                    Ok(_) => report.reused.push(unit.index),
                    Err(reason) => {
                        warn!(unit = unit.index, reason = %reason, "Demoting unverified unit");
                        if let Err(e) = tokio::fs::remove_file(&unit.artifact).await {
                            debug!(path = ?unit.artifact, error = %e, "No artifact to remove");
                        }
                        unit.status = UnitStatus::Pending;
                        unit.elapsed_ms = None;
                        unit.last_error = Some(reason);
                        report.unverified.push(unit.index);
                    }
                }
            }
            UnitStatus::Pending | UnitStatus::Failed => {}
        }
    }

    info!(
        job_id = %record.job.id,
        interrupted = report.interrupted.len(),
        unverified = report.unverified.len(),
        reused = report.reused.len(),
        staging_removed = report.staging_removed,
        "Reconciled progress record"
    );

    report
}

/// Deletes staging files a previous run left behind.
async fn remove_staging_files(paths: &JobPaths) -> usize {
    let pattern = match glob::Pattern::new(&paths.staging_pattern()) {
        Ok(pattern) => pattern,
        Err(e) => {
            warn!(error = %e, "Invalid staging pattern");
            return 0;
        }
    };
    let mut entries = match tokio::fs::read_dir(paths.work_dir()).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!(dir = ?paths.work_dir(), error = %e, "Cannot list work directory");
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let path = match entries.next_entry().await {
            Ok(Some(entry)) => entry.path(),
            Ok(None) => break,
            Err(e) => {
                warn!(dir = ?paths.work_dir(), error = %e, "Stopped listing work directory");
                break;
            }
        };
        if !pattern.matches_path(&path) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = ?path, "Removed stale staging file");
                removed += 1;
            }
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove staging file"),
        }
    }
    removed
}
