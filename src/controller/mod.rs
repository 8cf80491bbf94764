//! Job controller: the entry point front-ends use to run conversions.

pub mod events;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{
    ensure_resumable, finalize, reset_failed_units, EngineSettings, ResumeCoordinator, RunOutcome,
    StartMode,
};
use crate::encoder::Transcoder;
use crate::error::{EngineError, StoreError};
use crate::job::{Job, JobId, JobStatus};
use crate::store::{ProgressRecord, ProgressStore};

use events::{EventEmitter, EventKind, ProgressEvent, EVENT_CHANNEL_CAPACITY};

type RunResult = Result<RunOutcome, EngineError>;

/// Why a running job was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopIntent {
    None,
    Pause,
    Cancel { delete_artifacts: bool },
}

struct RunningJob {
    cancel: CancellationToken,
    intent: Arc<Mutex<StopIntent>>,
    handle: Option<JoinHandle<RunResult>>,
}

impl RunningJob {
    /// A handle taken by `wait` counts as running until the waiter removes
    /// the entry.
    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }
}

/// Starts, pauses, cancels and resumes conversion jobs and publishes their
/// progress.
///
/// Each job runs in its own task; at most `max_concurrent_jobs` of them
/// convert at once. Records are only written by the task running the job,
/// or by the controller while no task runs it.
pub struct JobController {
    settings: Arc<EngineSettings>,
    transcoder: Arc<dyn Transcoder>,
    store: Arc<dyn ProgressStore>,
    events: broadcast::Sender<ProgressEvent>,
    job_slots: Arc<Semaphore>,
    running: Mutex<HashMap<JobId, RunningJob>>,
}

impl JobController {
    pub fn new(
        settings: EngineSettings,
        transcoder: Arc<dyn Transcoder>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let job_slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            settings: Arc::new(settings),
            transcoder,
            store,
            events,
            job_slots,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Subscribes to progress events of every job.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Starts `job` from scratch, discarding any previous progress for it or
    /// its destination.
    pub fn start(&self, job: Job) -> Result<JobId, EngineError> {
        self.spawn(job, StartMode::Fresh)
    }

    /// Resumes a paused, interrupted or cancelled job from its record.
    ///
    /// Failed jobs, and records that still hold failed units, are refused
    /// with `InvalidState`; they need [`restart`](Self::restart).
    pub async fn resume(&self, job_id: &JobId) -> Result<JobId, EngineError> {
        self.ensure_idle(job_id)?;
        let record = self.load(job_id).await?;
        ensure_resumable(&record)?;
        self.spawn(record.job, StartMode::Resume)
    }

    /// Re-enters planning for a job, typically after it failed.
    ///
    /// With `discard` the old record and artifacts are dropped and the job
    /// is planned from scratch. Otherwise failed units are reset with a fresh
    /// attempt budget and done units are kept. A job that failed before it
    /// was planned is always planned from scratch.
    pub async fn restart(&self, job_id: &JobId, discard: bool) -> Result<JobId, EngineError> {
        self.ensure_idle(job_id)?;
        let mut record = self.load(job_id).await?;

        if discard || record.units.is_empty() {
            info!(job_id = %job_id, discard, "Restarting job from scratch");
            let job = Job::new(
                record.job.source.clone(),
                record.job.destination.clone(),
                record.job.projection,
                record.job.chunk_ms,
            )
            .with_encoding(record.job.encoding.clone());
            return self.spawn(job, StartMode::Fresh);
        }

        let reset = reset_failed_units(&mut record);
        info!(job_id = %job_id, units = ?reset, "Restarting failed units");
        self.store.save(&record).await?;
        self.spawn(record.job, StartMode::Resume)
    }

    /// Asks a running job to stop at a resumable point.
    ///
    /// In-flight units are terminated and return to pending; `wait` reports
    /// the paused outcome once the state is persisted.
    pub fn pause(&self, job_id: &JobId) -> Result<(), EngineError> {
        self.signal(job_id, StopIntent::Pause)
    }

    /// Stops a job and marks it cancelled, optionally deleting its partial
    /// artifacts. A job that is not running is marked directly; a failed one
    /// is refused with `InvalidState` and stays failed.
    pub async fn cancel(&self, job_id: &JobId, delete_artifacts: bool) -> Result<(), EngineError> {
        match self.signal(job_id, StopIntent::Cancel { delete_artifacts }) {
            Err(EngineError::JobNotFound { .. }) => {}
            other => return other,
        }

        let events = EventEmitter::new(self.events.clone(), job_id.clone());
        mark_cancelled(self.store.as_ref(), &self.settings, &events, job_id, delete_artifacts).await
    }

    /// Waits for a job started by this controller to finish its run.
    pub async fn wait(&self, job_id: &JobId) -> RunResult {
        let handle = {
            let mut running = lock(&self.running);
            running
                .get_mut(job_id)
                .and_then(|job| job.handle.take())
                .ok_or_else(|| EngineError::JobNotFound {
                    job_id: job_id.to_string(),
                })?
        };

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Internal(format!("job task failed: {e}"))),
        };

        lock(&self.running).remove(job_id);
        result
    }

    /// Returns the stored progress record of a job.
    pub async fn status(&self, job_id: &JobId) -> Result<ProgressRecord, EngineError> {
        self.load(job_id).await
    }

    /// Lists every readable progress record.
    pub async fn jobs(&self) -> Result<Vec<ProgressRecord>, EngineError> {
        Ok(self.store.list().await?)
    }

    /// Returns true while a job's task is running.
    pub fn is_running(&self, job_id: &JobId) -> bool {
        lock(&self.running)
            .get(job_id)
            .is_some_and(|job| !job.is_finished())
    }

    async fn load(&self, job_id: &JobId) -> Result<ProgressRecord, EngineError> {
        load_record(self.store.as_ref(), job_id).await
    }

    fn ensure_idle(&self, job_id: &JobId) -> Result<(), EngineError> {
        if self.is_running(job_id) {
            return Err(EngineError::AlreadyRunning {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }

    fn signal(&self, job_id: &JobId, intent: StopIntent) -> Result<(), EngineError> {
        let running = lock(&self.running);
        let job = running
            .get(job_id)
            .filter(|job| !job.is_finished())
            .ok_or_else(|| EngineError::JobNotFound {
                job_id: job_id.to_string(),
            })?;

        *lock(&job.intent) = intent;
        job.cancel.cancel();
        debug!(job_id = %job_id, ?intent, "Stop requested");
        Ok(())
    }

    fn spawn(&self, job: Job, mode: StartMode) -> Result<JobId, EngineError> {
        let job_id = job.id.clone();
        let mut running = lock(&self.running);
        if running.get(&job_id).is_some_and(|job| !job.is_finished()) {
            return Err(EngineError::AlreadyRunning {
                job_id: job_id.to_string(),
            });
        }

        let cancel = CancellationToken::new();
        let intent = Arc::new(Mutex::new(StopIntent::None));
        let events = EventEmitter::new(self.events.clone(), job_id.clone());

        let task = JobTask {
            settings: Arc::clone(&self.settings),
            transcoder: Arc::clone(&self.transcoder),
            store: Arc::clone(&self.store),
            job_slots: Arc::clone(&self.job_slots),
            events,
            cancel: cancel.clone(),
            intent: Arc::clone(&intent),
        };
        let handle = tokio::spawn(task.run(job, mode));

        info!(job_id = %job_id, ?mode, "Job submitted");
        running.insert(
            job_id.clone(),
            RunningJob {
                cancel,
                intent,
                handle: Some(handle),
            },
        );
        Ok(job_id)
    }
}

/// State moved into a job's task.
struct JobTask {
    settings: Arc<EngineSettings>,
    transcoder: Arc<dyn Transcoder>,
    store: Arc<dyn ProgressStore>,
    job_slots: Arc<Semaphore>,
    events: EventEmitter,
    cancel: CancellationToken,
    intent: Arc<Mutex<StopIntent>>,
}

impl JobTask {
    async fn run(self, job: Job, mode: StartMode) -> RunResult {
        let job_id = job.id.clone();
        let _permit = Arc::clone(&self.job_slots)
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Internal(format!("job slots closed: {e}")))?;
        debug!(job_id = %job_id, "Acquired job slot");

        let mut coordinator = ResumeCoordinator::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.transcoder),
            Arc::clone(&self.store),
            self.events.clone(),
        );
        let outcome = coordinator.run(job, mode, self.cancel.clone()).await?;

        let intent = *lock(&self.intent);
        match (outcome, intent) {
            (RunOutcome::Paused, StopIntent::Cancel { delete_artifacts }) => {
                mark_cancelled(
                    self.store.as_ref(),
                    &self.settings,
                    &self.events,
                    &job_id,
                    delete_artifacts,
                )
                .await?;
                Ok(RunOutcome::Cancelled)
            }
            (outcome, _) => Ok(outcome),
        }
    }
}

/// Marks a stopped job cancelled and optionally removes its artifacts.
async fn mark_cancelled(
    store: &dyn ProgressStore,
    settings: &EngineSettings,
    events: &EventEmitter,
    job_id: &JobId,
    delete_artifacts: bool,
) -> Result<(), EngineError> {
    let mut record = load_record(store, job_id).await?;

    match record.job.status {
        JobStatus::Completed => {
            warn!(job_id = %job_id, "Ignoring cancel of a completed job");
            return Ok(());
        }
        JobStatus::Failed => {
            return Err(EngineError::InvalidState {
                job_id: job_id.to_string(),
                status: record.job.status.to_string(),
            });
        }
        _ => {}
    }

    if delete_artifacts {
        finalize::cleanup(&settings.paths(job_id)).await;
        for unit in record.units.iter_mut() {
            unit.reset();
        }
    }

    record.job.cancel();
    store.save(&record).await?;
    info!(job_id = %job_id, delete_artifacts, "Job cancelled");
    events.emit(EventKind::Cancelled);
    Ok(())
}

async fn load_record(store: &dyn ProgressStore, job_id: &JobId) -> Result<ProgressRecord, EngineError> {
    store.load(job_id).await.map_err(|e| match e {
        StoreError::NotFound { job_id } => EngineError::JobNotFound { job_id },
        other => other.into(),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
