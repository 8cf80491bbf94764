//! Durable progress records for conversion jobs.

pub mod file;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::job::{Job, JobId, JobStatus};
use crate::planner::{UnitStatus, WorkUnit};

pub use file::FileProgressStore;

/// Change applied to one work unit inside a single store write.
pub type UnitUpdate = Box<dyn FnOnce(&mut WorkUnit) + Send>;

/// Current on-disk schema version of [`ProgressRecord`].
pub const SCHEMA_VERSION: u32 = 1;

/// Durable snapshot of a job and its ordered work units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub schema_version: u32,

    pub job: Job,

    /// Probed duration of the source in milliseconds.
    pub source_duration_ms: u64,

    /// Size of the source when the job was planned.
    pub source_bytes: u64,

    /// Work units in time order.
    pub units: Vec<WorkUnit>,

    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(job: Job, source_duration_ms: u64, source_bytes: u64, units: Vec<WorkUnit>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            job,
            source_duration_ms,
            source_bytes,
            units,
            updated_at: Utc::now(),
        }
    }

    /// Number of units in the given status.
    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    /// Returns true once every unit is done.
    pub fn all_done(&self) -> bool {
        !self.units.is_empty() && self.units.iter().all(|u| u.status == UnitStatus::Done)
    }

    /// Indices of pending units, in time order.
    pub fn pending_indices(&self) -> Vec<usize> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Pending)
            .map(|u| u.index)
            .collect()
    }

    /// Indices of failed units.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .map(|u| u.index)
            .collect()
    }

    /// Checks that the units cover `[0, source_duration_ms)` with no gaps or
    /// overlaps, in index order.
    pub fn is_contiguous(&self) -> bool {
        let mut cursor = 0;
        for (i, unit) in self.units.iter().enumerate() {
            if unit.index != i || unit.range.start_ms != cursor || unit.range.len_ms() == 0 {
                return false;
            }
            cursor = unit.range.end_ms;
        }
        !self.units.is_empty() && cursor == self.source_duration_ms
    }

    /// Contiguous units, or no units at all for a job that failed while
    /// planning.
    pub fn is_consistent(&self) -> bool {
        if self.units.is_empty() {
            return self.job.status == JobStatus::Failed;
        }
        self.is_contiguous()
    }

    /// Total media time of done units, in milliseconds.
    pub fn done_media_ms(&self) -> u64 {
        self.units
            .iter()
            .filter(|u| u.status == UnitStatus::Done)
            .map(|u| u.range.len_ms())
            .sum()
    }
}

/// Durable, atomic storage of progress records keyed by job id.
///
/// Implementations must never expose a partially written record: a crash
/// during `save` leaves either the previous or the new record on disk.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Loads the record of a job.
    async fn load(&self, job_id: &JobId) -> Result<ProgressRecord, StoreError>;

    /// Durably replaces the record of a job.
    async fn save(&self, record: &ProgressRecord) -> Result<(), StoreError>;

    /// Applies `update` to one unit and persists the record in one step.
    async fn update_unit(
        &self,
        job_id: &JobId,
        index: usize,
        update: UnitUpdate,
    ) -> Result<ProgressRecord, StoreError>;

    /// Removes the record of a job. Missing records are not an error.
    async fn delete(&self, job_id: &JobId) -> Result<(), StoreError>;

    /// Lists every readable record. Unreadable records are skipped.
    async fn list(&self) -> Result<Vec<ProgressRecord>, StoreError>;

    /// Sets the status of one unit and persists the record in one step.
    async fn mark_unit(
        &self,
        job_id: &JobId,
        index: usize,
        status: UnitStatus,
    ) -> Result<ProgressRecord, StoreError> {
        self.update_unit(job_id, index, Box::new(move |unit: &mut WorkUnit| unit.status = status))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FailureReport, ErrorKind, JobPaths, ProjectionParams};
    use crate::planner::plan_units;
    use std::path::{Path, PathBuf};

    fn job() -> Job {
        Job::new(
            PathBuf::from("/in.mp4"),
            PathBuf::from("/out.mp4"),
            ProjectionParams::default(),
            Some(60_000),
        )
    }

    #[test]
    fn planned_record_is_consistent() {
        let job = job();
        let paths = JobPaths::new(Path::new("/state"), &job.id);
        let units = plan_units(125_000, job.chunk_ms, &paths).unwrap();
        assert!(ProgressRecord::new(job, 125_000, 1, units).is_consistent());
    }

    #[test]
    fn unit_free_record_is_only_valid_once_failed() {
        let mut record = ProgressRecord::new(job(), 0, 0, Vec::new());
        assert!(!record.is_consistent());

        record
            .job
            .fail(FailureReport::new(ErrorKind::InvalidDuration, Vec::new(), "0 ms"));
        assert!(record.is_consistent());
        assert!(!record.all_done());
    }
}
