//! Progress events published to subscribers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::coordinator::CoordinatorState;
use crate::job::{FailureReport, JobId};
use crate::planner::UnitStatus;
use crate::store::ProgressRecord;

/// Capacity of the event channel; slow subscribers lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Percentage reported while partial artifacts are removed.
pub const CLEANUP_PERCENT: u8 = 99;

/// A single notification about a job.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

/// What happened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged { state: CoordinatorState },
    UnitStarted { index: usize, attempt: u32 },
    UnitFinished {
        index: usize,
        status: UnitStatus,
        elapsed_ms: Option<u64>,
    },
    Progress(ProgressSnapshot),
    Paused,
    Cancelled,
    Completed { output: PathBuf },
    Failed { report: FailureReport },
}

impl EventKind {
    /// True for events after which the job emits nothing else in this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::Paused
                | EventKind::Cancelled
                | EventKind::Completed { .. }
                | EventKind::Failed { .. }
        )
    }
}

/// Aggregate progress of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub units_done: usize,
    pub units_total: usize,
    /// Overall completion, 0-100.
    pub percent: u8,
    /// Estimated seconds remaining, once any unit has timing history.
    pub eta_secs: Option<u64>,
}

impl ProgressSnapshot {
    /// Builds a snapshot of `record` while the coordinator is in `state`.
    pub fn of(record: &ProgressRecord, state: CoordinatorState, workers: usize) -> Self {
        let units_done = record.count(UnitStatus::Done);
        let units_total = record.units.len();
        Self {
            units_done,
            units_total,
            percent: percent_for(state, units_done, units_total),
            eta_secs: estimate_eta_secs(record, workers),
        }
    }
}

/// Maps coordinator progress onto a 0-100 scale.
///
/// Conversion spans 1-97, leaving 98 for assembling the output, 99 for
/// cleanup and 100 for completion.
pub fn percent_for(state: CoordinatorState, done: usize, total: usize) -> u8 {
    match state {
        CoordinatorState::Fresh | CoordinatorState::Planning | CoordinatorState::Reconciling => 0,
        CoordinatorState::Executing | CoordinatorState::Failed => {
            if total == 0 {
                return 1;
            }
            let fraction = done.min(total) as f64 / total as f64;
            1 + (fraction * 97.0).round() as u8
        }
        CoordinatorState::Finalizing => 98,
        CoordinatorState::Completed => 100,
    }
}

/// Estimates the remaining wall-clock seconds.
///
/// Uses the average processing time per media second over done units with
/// timing history, applied to the media time still outstanding and spread
/// across `workers`.
pub fn estimate_eta_secs(record: &ProgressRecord, workers: usize) -> Option<u64> {
    let (media_ms, wall_ms) = record
        .units
        .iter()
        .filter(|u| u.status == UnitStatus::Done)
        .filter_map(|u| u.elapsed_ms.map(|e| (u.range.len_ms(), e)))
        .fold((0u64, 0u64), |(m, w), (len, e)| (m + len, w + e));

    if media_ms == 0 {
        return None;
    }

    let remaining_ms: u64 = record
        .units
        .iter()
        .filter(|u| u.status != UnitStatus::Done)
        .map(|u| u.range.len_ms())
        .sum();

    let rate = wall_ms as f64 / media_ms as f64;
    let secs = rate * remaining_ms as f64 / 1000.0 / workers.max(1) as f64;
    Some(secs.round() as u64)
}

/// Publishes events for one job onto the shared channel.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<ProgressEvent>,
    job_id: JobId,
}

impl EventEmitter {
    pub fn new(tx: broadcast::Sender<ProgressEvent>, job_id: JobId) -> Self {
        Self { tx, job_id }
    }

    /// Sends an event without blocking. Having no subscribers is fine.
    pub fn emit(&self, kind: EventKind) {
        let event = ProgressEvent {
            job_id: self.job_id.clone(),
            at: Utc::now(),
            kind,
        };
        if self.tx.send(event).is_err() {
            trace!(job_id = %self.job_id, "No subscribers for progress event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobPaths, ProjectionParams};
    use crate::planner::plan_units;

    fn record(duration_ms: u64, chunk_ms: u64) -> ProgressRecord {
        let job = Job::new(
            PathBuf::from("/in.mp4"),
            PathBuf::from("/out.mp4"),
            ProjectionParams::default(),
            Some(chunk_ms),
        );
        let paths = JobPaths::new(std::path::Path::new("/state"), &job.id);
        let units = plan_units(duration_ms, Some(chunk_ms), &paths).unwrap();
        ProgressRecord::new(job, duration_ms, 1, units)
    }

    #[test]
    fn percent_follows_phases() {
        assert_eq!(percent_for(CoordinatorState::Planning, 0, 3), 0);
        assert_eq!(percent_for(CoordinatorState::Executing, 0, 3), 1);
        assert_eq!(percent_for(CoordinatorState::Executing, 3, 3), 98);
        assert_eq!(percent_for(CoordinatorState::Executing, 1, 2), 50);
        assert_eq!(percent_for(CoordinatorState::Finalizing, 3, 3), 98);
        assert_eq!(percent_for(CoordinatorState::Completed, 3, 3), 100);
    }

    #[test]
    fn no_eta_without_history() {
        let record = record(125_000, 60_000);
        assert_eq!(estimate_eta_secs(&record, 1), None);
    }

    #[test]
    fn eta_scales_with_remaining_media_and_workers() {
        let mut record = record(180_000, 60_000);
        record.units[0].status = UnitStatus::Done;
        // 60 s of media took 120 s
        record.units[0].elapsed_ms = Some(120_000);

        assert_eq!(estimate_eta_secs(&record, 1), Some(240));
        assert_eq!(estimate_eta_secs(&record, 2), Some(120));

        let snapshot = ProgressSnapshot::of(&record, CoordinatorState::Executing, 2);
        assert_eq!(snapshot.units_done, 1);
        assert_eq!(snapshot.units_total, 3);
        assert_eq!(snapshot.percent, 33);
        assert_eq!(snapshot.eta_secs, Some(120));
    }

    #[tokio::test]
    async fn emitter_tags_events_with_the_job() {
        let (tx, mut rx) = broadcast::channel(4);
        let emitter = EventEmitter::new(tx, JobId::from_string("job-1"));
        emitter.emit(EventKind::Paused);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id.as_str(), "job-1");
        assert!(event.kind.is_terminal());
    }
}
