//! Bounded worker pool that drives pending units through the transcoder.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::{FailureAction, RetryPolicy};
use super::CoordinatorState;
use crate::controller::events::{EventEmitter, EventKind, ProgressSnapshot};
use crate::encoder::{Transcoder, UnitOutcome, UnitRequest};
use crate::error::EngineError;
use crate::job::JobPaths;
use crate::planner::{UnitStatus, WorkUnit};
use crate::store::{ProgressRecord, ProgressStore, UnitUpdate};

/// How execution stopped.
#[derive(Debug)]
pub enum ExecOutcome {
    /// Every unit is done.
    AllDone,
    /// Cancellation stopped execution at a resumable point.
    Cancelled,
    /// A unit failed fatally or ran out of attempts.
    Failed(EngineError),
}

/// Everything the pool needs besides the record itself.
pub struct Executor<'a> {
    pub transcoder: Arc<dyn Transcoder>,
    pub store: &'a dyn ProgressStore,
    pub paths: &'a JobPaths,
    pub events: &'a EventEmitter,
    pub retry: RetryPolicy,
    pub workers: usize,
}

struct Finished {
    index: usize,
    outcome: UnitOutcome,
    elapsed_ms: u64,
}

impl Executor<'_> {
    /// Runs pending units until all are done, one fails terminally, or
    /// `cancel` fires.
    ///
    /// This task is the only writer of the record: every transition is
    /// persisted before the next unit is dispatched or acknowledged. If the
    /// store fails, in-flight units are cancelled and awaited before the
    /// error is returned.
    pub async fn run(
        &self,
        record: &mut ProgressRecord,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, EngineError> {
        let job_id = record.job.id.clone();
        let mut queue: VecDeque<usize> = record.pending_indices().into();
        let abort = cancel.child_token();
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut failure: Option<EngineError> = None;
        let workers = self.workers.max(1);

        info!(job_id = %job_id, pending = queue.len(), workers, "Executing work units");

        loop {
            while failure.is_none() && !abort.is_cancelled() && tasks.len() < workers {
                let Some(index) = queue.pop_front() else {
                    break;
                };
                let request = match self.begin_unit(record, index).await {
                    Ok(request) => request,
                    Err(err) => return Err(drain(&mut tasks, &abort, err).await),
                };
                let transcoder = Arc::clone(&self.transcoder);
                let token = abort.child_token();
                tasks.spawn(async move {
                    let started = Instant::now();
                    let outcome = transcoder.transcode_unit(&request, token).await;
                    Finished {
                        index: request.index,
                        outcome,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            let finished = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Unit task panicked");
                    failure.get_or_insert(EngineError::Internal(format!("unit task failed: {e}")));
                    abort.cancel();
                    continue;
                }
            };

            match self.finish_unit(record, finished, &mut queue).await {
                Ok(Some(err)) => {
                    if failure.is_none() {
                        warn!(job_id = %job_id, error = %err, "Stopping sibling units");
                        failure = Some(err);
                    }
                    abort.cancel();
                }
                Ok(None) => {}
                Err(err) => return Err(drain(&mut tasks, &abort, err).await),
            }
        }

        self.demote_in_progress(record).await?;

        if let Some(err) = failure {
            return Ok(ExecOutcome::Failed(err));
        }
        if record.all_done() {
            return Ok(ExecOutcome::AllDone);
        }
        if cancel.is_cancelled() {
            return Ok(ExecOutcome::Cancelled);
        }
        Err(EngineError::Internal(format!(
            "job {job_id} stopped with unfinished units {:?}",
            record.failed_indices()
        )))
    }

    /// Marks a unit in progress and charges an attempt.
    async fn begin_unit(
        &self,
        record: &mut ProgressRecord,
        index: usize,
    ) -> Result<UnitRequest, EngineError> {
        let job_id = record.job.id.clone();
        *record = self
            .store
            .update_unit(
                &job_id,
                index,
                Box::new(|unit: &mut WorkUnit| {
                    unit.status = UnitStatus::InProgress;
                    unit.attempts += 1;
                }),
            )
            .await?;

        let unit = &record.units[index];
        debug!(job_id = %job_id, unit = index, attempt = unit.attempts, "Dispatching unit");
        self.events.emit(EventKind::UnitStarted {
            index,
            attempt: unit.attempts,
        });

        Ok(UnitRequest {
            job_id,
            index,
            range: unit.range,
            source: record.job.source.clone(),
            projection: record.job.projection,
            staging: self.paths.unit_staging(index),
            artifact: unit.artifact.clone(),
        })
    }

    /// Records a unit's outcome. Returns the error that must stop the job,
    /// if any.
    async fn finish_unit(
        &self,
        record: &mut ProgressRecord,
        finished: Finished,
        queue: &mut VecDeque<usize>,
    ) -> Result<Option<EngineError>, EngineError> {
        let job_id = record.job.id.clone();
        let Finished {
            index,
            outcome,
            elapsed_ms,
        } = finished;
        let mut stop = None;

        let update: UnitUpdate = match outcome {
            UnitOutcome::Success(info) => {
                info!(job_id = %job_id, unit = index, elapsed_ms, bytes = info.bytes, "Unit done");
                Box::new(move |unit: &mut WorkUnit| {
                    unit.status = UnitStatus::Done;
                    unit.elapsed_ms = Some(elapsed_ms);
                    unit.last_error = None;
                })
            }
            UnitOutcome::Cancelled => {
                debug!(job_id = %job_id, unit = index, "Unit cancelled");
                Box::new(|unit: &mut WorkUnit| {
                    unit.status = UnitStatus::Pending;
                    unit.attempts = unit.attempts.saturating_sub(1);
                })
            }
            UnitOutcome::TransientFailure { reason } => {
                let attempts = record.units[index].attempts;
                match self.retry.on_transient(attempts, &reason) {
                    FailureAction::Retrying { attempt, max_attempts } => {
                        warn!(job_id = %job_id, unit = index, attempt, max_attempts, reason = %reason, "Unit failed, retrying");
                        queue.push_front(index);
                        Box::new(move |unit: &mut WorkUnit| {
                            unit.status = UnitStatus::Pending;
                            unit.last_error = Some(reason);
                        })
                    }
                    FailureAction::Exhausted { reason: summary } => {
                        error!(job_id = %job_id, unit = index, attempts, reason = %reason, "Unit exhausted its attempts");
                        stop = Some(EngineError::RetryExhausted {
                            unit: index,
                            attempts,
                            last_error: reason,
                        });
                        Box::new(move |unit: &mut WorkUnit| {
                            unit.status = UnitStatus::Failed;
                            unit.last_error = Some(summary);
                        })
                    }
                }
            }
            UnitOutcome::FatalFailure { reason } => {
                error!(job_id = %job_id, unit = index, reason = %reason, "Unit failed fatally");
                stop = Some(EngineError::Fatal {
                    unit: Some(index),
                    message: reason.clone(),
                });
                Box::new(move |unit: &mut WorkUnit| {
                    unit.status = UnitStatus::Failed;
                    unit.last_error = Some(reason);
                })
            }
        };

        *record = self.store.update_unit(&job_id, index, update).await?;

        let unit = &record.units[index];
        self.events.emit(EventKind::UnitFinished {
            index,
            status: unit.status,
            elapsed_ms: unit.elapsed_ms,
        });
        self.events.emit(EventKind::Progress(ProgressSnapshot::of(
            record,
            CoordinatorState::Executing,
            self.workers,
        )));

        Ok(stop)
    }

    /// Returns units left in progress to pending so the record never claims
    /// work that is not running.
    async fn demote_in_progress(&self, record: &mut ProgressRecord) -> Result<(), EngineError> {
        let job_id = record.job.id.clone();
        let stale: Vec<usize> = record
            .units
            .iter()
            .filter(|u| u.status == UnitStatus::InProgress)
            .map(|u| u.index)
            .collect();

        for index in stale {
            *record = self
                .store
                .update_unit(
                    &job_id,
                    index,
                    Box::new(|unit: &mut WorkUnit| {
                        unit.status = UnitStatus::Pending;
                        unit.attempts = unit.attempts.saturating_sub(1);
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

/// Cancels every in-flight unit and waits for each to exit before handing
/// back `err`. Units still in progress are demoted by the next reconcile.
async fn drain(tasks: &mut JoinSet<Finished>, abort: &CancellationToken, err: EngineError) -> EngineError {
    abort.cancel();
    let mut stopped = 0;
    while let Some(joined) = tasks.join_next().await {
        if joined.is_ok() {
            stopped += 1;
        }
    }
    error!(error = %err, stopped, "Progress store failed, stopped in-flight units");
    err
}
