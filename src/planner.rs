//! Segment planning: splits a job into time-bounded work units.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::job::JobPaths;

/// Half-open time range `[start_ms, end_ms)` of the source media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeRange {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    /// Length of the range in milliseconds.
    pub fn len_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Status of a single work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Smallest independently resumable slice of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Position of this unit in time order.
    pub index: usize,

    /// Source time range covered by this unit.
    pub range: TimeRange,

    pub status: UnitStatus,

    /// Number of transcoder invocations charged to this unit.
    pub attempts: u32,

    /// Path of the unit's partial artifact.
    pub artifact: PathBuf,

    /// Wall-clock time of the successful attempt, kept for ETA estimates.
    #[serde(default)]
    pub elapsed_ms: Option<u64>,

    /// Last error observed for this unit.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl WorkUnit {
    fn pending(index: usize, range: TimeRange, artifact: PathBuf) -> Self {
        Self {
            index,
            range,
            status: UnitStatus::Pending,
            attempts: 0,
            artifact,
            elapsed_ms: None,
            last_error: None,
        }
    }

    /// Returns the unit to a clean pending state.
    pub fn reset(&mut self) {
        self.status = UnitStatus::Pending;
        self.attempts = 0;
        self.elapsed_ms = None;
        self.last_error = None;
    }
}

/// Converts a probed duration in seconds to whole milliseconds.
///
/// Non-finite and negative values map to zero so the planner rejects them.
pub fn duration_ms_from_secs(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1000.0).round() as u64
    } else {
        0
    }
}

/// Plans the time ranges for a duration and optional chunk length.
///
/// The ranges are contiguous, non-overlapping and cover `[0, duration_ms)`
/// exactly; the last range is shortened when the duration is not a multiple
/// of the chunk length. `None` yields a single range.
pub fn plan_ranges(duration_ms: u64, chunk_ms: Option<u64>) -> Result<Vec<TimeRange>, PlanError> {
    if duration_ms == 0 {
        return Err(PlanError::InvalidDuration { duration_ms });
    }

    let chunk = match chunk_ms {
        Some(0) => return Err(PlanError::InvalidChunkLength),
        Some(c) => c.min(duration_ms),
        None => duration_ms,
    };

    let count = duration_ms.div_ceil(chunk);
    let ranges = (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = ((i + 1) * chunk).min(duration_ms);
            TimeRange::new(start, end)
        })
        .collect();

    Ok(ranges)
}

/// Plans the pending work units of a job.
pub fn plan_units(
    duration_ms: u64,
    chunk_ms: Option<u64>,
    paths: &JobPaths,
) -> Result<Vec<WorkUnit>, PlanError> {
    let units = plan_ranges(duration_ms, chunk_ms)?
        .into_iter()
        .enumerate()
        .map(|(index, range)| WorkUnit::pending(index, range, paths.unit_artifact(index)))
        .collect();

    Ok(units)
}
