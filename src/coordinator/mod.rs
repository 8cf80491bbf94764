//! Resume coordinator: plans or reconciles a job, executes its units and
//! assembles the output.

pub mod executor;
pub mod finalize;
pub mod reconcile;
pub mod retry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::controller::events::{EventEmitter, EventKind, ProgressSnapshot, CLEANUP_PERCENT};
use crate::encoder::Transcoder;
use crate::error::{EngineError, StoreError};
use crate::job::{FailureReport, InputLayout, Job, JobId, JobPaths, JobStatus};
use crate::media::VideoStream;
use crate::planner::{plan_units, UnitStatus};
use crate::store::{ProgressRecord, ProgressStore};

use executor::{ExecOutcome, Executor};
use finalize::FinalizeOutcome;
use retry::RetryPolicy;

/// Phase of a job inside one coordinator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Fresh,
    Planning,
    Reconciling,
    Executing,
    Finalizing,
    Completed,
    Failed,
}

/// How a run enters the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Discard any previous progress and plan from scratch.
    Fresh,
    /// Continue from the stored progress record.
    Resume,
}

/// How a run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The output is in place and verified.
    Completed { output: PathBuf, duration_ms: u64 },
    /// Stopped at a resumable point.
    Paused,
    /// Stopped and marked cancelled by the user.
    Cancelled,
}

/// Engine-wide settings shared by every job.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Directory holding progress records and partial artifacts.
    pub state_root: PathBuf,
    /// Units converted in parallel within one job.
    pub workers_per_job: usize,
    /// Jobs converted in parallel.
    pub max_concurrent_jobs: usize,
    pub max_attempts: u32,
    pub unit_tolerance_ms: u64,
    pub output_tolerance_ms: u64,
    pub min_artifact_bytes: u64,
    /// Remove partial artifacts once the output is verified.
    pub cleanup_artifacts: bool,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig, state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            workers_per_job: config.concurrency.workers_per_job.max(1),
            max_concurrent_jobs: config.concurrency.max_concurrent_jobs.max(1),
            max_attempts: config.retry.max_attempts,
            unit_tolerance_ms: config.verification.unit_tolerance_ms,
            output_tolerance_ms: config.verification.output_tolerance_ms,
            min_artifact_bytes: config.verification.min_artifact_bytes,
            cleanup_artifacts: config.verification.cleanup_artifacts,
        }
    }

    pub fn paths(&self, job_id: &JobId) -> JobPaths {
        JobPaths::new(&self.state_root, job_id)
    }
}

/// Drives one job from its stored state to completion.
pub struct ResumeCoordinator {
    settings: Arc<EngineSettings>,
    transcoder: Arc<dyn Transcoder>,
    store: Arc<dyn ProgressStore>,
    events: EventEmitter,
    state: CoordinatorState,
}

impl ResumeCoordinator {
    pub fn new(
        settings: Arc<EngineSettings>,
        transcoder: Arc<dyn Transcoder>,
        store: Arc<dyn ProgressStore>,
        events: EventEmitter,
    ) -> Self {
        Self {
            settings,
            transcoder,
            store,
            events,
            state: CoordinatorState::Fresh,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    fn transition(&mut self, state: CoordinatorState) {
        debug!(from = ?self.state, to = ?state, "Coordinator transition");
        self.state = state;
        self.events.emit(EventKind::StateChanged { state });
    }

    /// Runs `job` until it completes, fails or `cancel` fires.
    ///
    /// Failures after planning are persisted on the record before the error
    /// is returned.
    pub async fn run(
        &mut self,
        job: Job,
        mode: StartMode,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let paths = self.settings.paths(&job.id);

        let mut record = match mode {
            StartMode::Fresh => {
                self.transition(CoordinatorState::Planning);
                self.supersede(&job).await?;
                match self.plan(job.clone(), &paths).await {
                    Ok(record) => record,
                    Err(err) => return Err(self.fail_unplanned(&job, err).await),
                }
            }
            StartMode::Resume => {
                self.transition(CoordinatorState::Planning);
                let mut record = self.store.load(&job.id).await?;
                ensure_resumable(&record)?;
                match record.job.status {
                    JobStatus::Completed if record.job.destination.exists() => {
                        info!(job_id = %job.id, "Job already completed");
                        self.transition(CoordinatorState::Completed);
                        return Ok(RunOutcome::Completed {
                            output: record.job.destination.clone(),
                            duration_ms: record.source_duration_ms,
                        });
                    }
                    JobStatus::Completed => {
                        warn!(job_id = %job.id, "Completed output is missing, converting again");
                        self.supersede(&record.job).await?;
                        match self.plan(record.job.clone(), &paths).await {
                            Ok(record) => record,
                            Err(err) => return Err(self.fail_unplanned(&record.job, err).await),
                        }
                    }
                    _ => {
                        if let Err(err) = self.check_source(&record).await {
                            return Err(self.fail(&mut record, err).await);
                        }
                        self.transition(CoordinatorState::Reconciling);
                        reconcile::reconcile(
                            &mut record,
                            &paths,
                            self.transcoder.as_ref(),
                            self.settings.unit_tolerance_ms,
                            self.settings.min_artifact_bytes,
                        )
                        .await;
                        record
                    }
                }
            }
        };

        record.job.start();
        self.store.save(&record).await?;

        if cancel.is_cancelled() {
            return self.pause(&mut record).await;
        }

        self.transition(CoordinatorState::Executing);
        self.events.emit(EventKind::Progress(ProgressSnapshot::of(
            &record,
            CoordinatorState::Executing,
            self.settings.workers_per_job,
        )));

        let executor = Executor {
            transcoder: Arc::clone(&self.transcoder),
            store: self.store.as_ref(),
            paths: &paths,
            events: &self.events,
            retry: RetryPolicy::new(self.settings.max_attempts),
            workers: self.settings.workers_per_job,
        };

        let outcome = match executor.run(&mut record, &cancel).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail(&mut record, err).await),
        };

        match outcome {
            ExecOutcome::Failed(err) => return Err(self.fail(&mut record, err).await),
            ExecOutcome::Cancelled => return self.pause(&mut record).await,
            ExecOutcome::AllDone if cancel.is_cancelled() => return self.pause(&mut record).await,
            ExecOutcome::AllDone => {}
        }

        self.finalize(record, &paths, cancel).await
    }

    /// Probes the source and persists a freshly planned record.
    async fn plan(&mut self, mut job: Job, paths: &JobPaths) -> Result<ProgressRecord, EngineError> {
        let probe = self
            .transcoder
            .probe(&job.source)
            .await
            .map_err(|e| EngineError::Fatal {
                unit: None,
                message: format!("cannot read source '{}': {e}", job.source.display()),
            })?;

        let Some(stream) = probe.video_streams.first() else {
            return Err(EngineError::Fatal {
                unit: None,
                message: format!("source '{}' has no video stream", job.source.display()),
            });
        };
        if let Some(warning) = layout_warning(job.projection.layout, stream) {
            warn!(job_id = %job.id, width = stream.width, height = stream.height, "{warning}");
        }

        let duration_ms = probe.duration_ms();
        let units = plan_units(duration_ms, job.chunk_ms, paths)?;
        let source_bytes = source_size(&job.source).await?;

        tokio::fs::create_dir_all(paths.work_dir())
            .await
            .map_err(|e| StoreError::Io {
                path: paths.work_dir().to_path_buf(),
                source: e,
            })?;

        info!(
            job_id = %job.id,
            duration_ms,
            units = units.len(),
            chunk_ms = ?job.chunk_ms,
            "Planned job"
        );

        job.status = JobStatus::Pending;
        job.failure = None;
        let record = ProgressRecord::new(job, duration_ms, source_bytes, units);
        self.store.save(&record).await?;
        Ok(record)
    }

    /// Removes progress of this job and of any job writing the same
    /// destination with different parameters.
    async fn supersede(&self, job: &Job) -> Result<(), EngineError> {
        let mut stale: Vec<JobId> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.job.id != job.id && r.job.destination == job.destination)
            .map(|r| r.job.id)
            .collect();
        stale.push(job.id.clone());

        for id in stale {
            if id != job.id {
                info!(job_id = %id, destination = ?job.destination, "Discarding superseded job");
            }
            self.store.delete(&id).await?;
            finalize::cleanup(&self.settings.paths(&id)).await;
        }
        Ok(())
    }

    /// Rejects a resume if the source changed since it was planned.
    async fn check_source(&self, record: &ProgressRecord) -> Result<(), EngineError> {
        let bytes = source_size(&record.job.source).await?;
        if bytes != record.source_bytes {
            return Err(EngineError::Fatal {
                unit: None,
                message: format!(
                    "source '{}' changed since progress was recorded ({} bytes, was {})",
                    record.job.source.display(),
                    bytes,
                    record.source_bytes
                ),
            });
        }
        Ok(())
    }

    async fn finalize(
        &mut self,
        record: ProgressRecord,
        paths: &JobPaths,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        self.transition(CoordinatorState::Finalizing);

        // concatenate from what the store holds, not the in-memory copy
        let mut record = match self.store.load(&record.job.id).await {
            Ok(record) => record,
            Err(err) => {
                let mut record = record;
                return Err(self.fail(&mut record, err.into()).await);
            }
        };
        self.events.emit(EventKind::Progress(ProgressSnapshot::of(
            &record,
            CoordinatorState::Finalizing,
            self.settings.workers_per_job,
        )));

        let assembled = finalize::assemble(
            &record,
            paths,
            self.transcoder.as_ref(),
            RetryPolicy::new(self.settings.max_attempts),
            self.settings.output_tolerance_ms,
            self.settings.min_artifact_bytes,
            cancel,
        )
        .await;

        let info = match assembled {
            Ok(FinalizeOutcome::Assembled(info)) => info,
            Ok(FinalizeOutcome::Cancelled) => return self.pause(&mut record).await,
            Err(err) => return Err(self.fail(&mut record, err).await),
        };

        if self.settings.cleanup_artifacts {
            self.events.emit(EventKind::Progress(ProgressSnapshot {
                percent: CLEANUP_PERCENT,
                ..ProgressSnapshot::of(&record, CoordinatorState::Finalizing, self.settings.workers_per_job)
            }));
            finalize::cleanup(paths).await;
        }

        record.job.complete();
        self.store.save(&record).await?;

        self.transition(CoordinatorState::Completed);
        self.events.emit(EventKind::Progress(ProgressSnapshot::of(
            &record,
            CoordinatorState::Completed,
            self.settings.workers_per_job,
        )));
        self.events.emit(EventKind::Completed {
            output: info.path.clone(),
        });
        info!(job_id = %record.job.id, output = ?info.path, "Job completed");

        Ok(RunOutcome::Completed {
            output: info.path,
            duration_ms: info.duration_ms,
        })
    }

    async fn pause(&mut self, record: &mut ProgressRecord) -> Result<RunOutcome, EngineError> {
        record.job.pause();
        self.store.save(record).await?;
        info!(
            job_id = %record.job.id,
            done = record.count(UnitStatus::Done),
            total = record.units.len(),
            "Job paused"
        );
        self.events.emit(EventKind::Paused);
        Ok(RunOutcome::Paused)
    }

    /// Marks the job failed, persists the reason and hands the error back.
    async fn fail(&mut self, record: &mut ProgressRecord, err: EngineError) -> EngineError {
        let report = FailureReport::from(&err);
        error!(job_id = %record.job.id, kind = ?report.kind, units = ?report.units, error = %err, "Job failed");

        record.job.fail(report.clone());
        if let Err(e) = self.store.save(record).await {
            error!(job_id = %record.job.id, error = %e, "Failed to persist job failure");
        }

        self.transition(CoordinatorState::Failed);
        self.events.emit(EventKind::Failed { report });
        err
    }

    /// Persists a job that failed before it had any units, so its status
    /// and reason survive for `status` and a later restart.
    async fn fail_unplanned(&mut self, job: &Job, err: EngineError) -> EngineError {
        warn!(job_id = %job.id, "Job failed during planning");
        let mut record = ProgressRecord::new(job.clone(), 0, 0, Vec::new());
        self.fail(&mut record, err).await
    }
}

/// Rejects records a plain resume must not continue: failed jobs and jobs
/// that still hold failed units. Both need an explicit restart.
pub fn ensure_resumable(record: &ProgressRecord) -> Result<(), EngineError> {
    let failed = record.failed_indices();
    if record.job.status.is_resumable() && failed.is_empty() {
        return Ok(());
    }

    let status = if failed.is_empty() {
        record.job.status.to_string()
    } else {
        format!("{} with failed units {:?}", record.job.status, failed)
    };
    Err(EngineError::InvalidState {
        job_id: record.job.id.to_string(),
        status,
    })
}

/// Describes a mismatch between the configured lens layout and the frame
/// shape of the source, if any.
fn layout_warning(layout: InputLayout, stream: &VideoStream) -> Option<&'static str> {
    match (layout, stream.looks_side_by_side()) {
        (InputLayout::FisheyeSbs, false) => {
            Some("Source frame is not 2:1, expected two fisheye views side by side")
        }
        (InputLayout::Fisheye, true) => {
            Some("Source frame is 2:1 and may hold two fisheye views; consider --layout fisheye-sbs")
        }
        _ => None,
    }
}

/// Resets failed units so a restart retries them with a fresh budget.
///
/// Done units keep their artifacts. Returns the indices that were reset.
pub fn reset_failed_units(record: &mut ProgressRecord) -> Vec<usize> {
    let failed = record.failed_indices();
    for &index in &failed {
        record.units[index].reset();
    }
    record.job.pause();
    record.job.failure = None;
    failed
}

async fn source_size(source: &Path) -> Result<u64, EngineError> {
    tokio::fs::metadata(source)
        .await
        .map(|m| m.len())
        .map_err(|e| EngineError::Fatal {
            unit: None,
            message: format!("cannot read source '{}': {e}", source.display()),
        })
}
