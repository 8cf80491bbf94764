//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use equirect_pipeline::controller::events::{EventKind, ProgressEvent};
use equirect_pipeline::controller::JobController;
use equirect_pipeline::coordinator::EngineSettings;
use equirect_pipeline::encoder::{ArtifactInfo, Transcoder, UnitOutcome, UnitRequest};
use equirect_pipeline::error::TranscodeError;
use equirect_pipeline::job::{Job, JobId, ProjectionParams};
use equirect_pipeline::media::{MediaInfo, ProbeResult, VideoStream};
use equirect_pipeline::planner::{plan_units, UnitStatus};
use equirect_pipeline::store::{FileProgressStore, ProgressRecord};

/// Fake media files are text: `video:<ms>` or `audio:<ms>`.
pub fn media_body(duration_ms: u64) -> String {
    format!("video:{duration_ms}")
}

/// What the fake does for one invocation of a unit.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Transient(&'static str),
    Fatal(&'static str),
    /// Runs until cancelled.
    Block,
}

/// Transcoder that writes tiny text "media" files instead of running ffmpeg.
///
/// Unit invocations follow a per-index script of [`Step`]s and succeed once
/// the script for that index is used up.
pub struct FakeTranscoder {
    script: Mutex<HashMap<usize, VecDeque<Step>>>,
    calls: Mutex<Vec<(JobId, usize)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: watch::Sender<usize>,
    short_output: AtomicBool,
}

impl FakeTranscoder {
    pub fn new() -> Arc<Self> {
        let (started, _) = watch::channel(0);
        Arc::new(Self {
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started,
            short_output: AtomicBool::new(false),
        })
    }

    /// Queues steps for a unit index.
    pub fn script(&self, index: usize, steps: impl IntoIterator<Item = Step>) {
        self.script
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .extend(steps);
    }

    /// Makes concatenation produce an output half as long as its parts.
    pub fn truncate_output(&self) {
        self.short_output.store(true, Ordering::SeqCst);
    }

    /// Sorted unit indices invoked for a job.
    pub fn calls_for(&self, job_id: &JobId) -> Vec<usize> {
        let mut calls: Vec<usize> = self
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, index)| *index)
            .collect();
        calls.sort_unstable();
        calls
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` invocations have started.
    pub async fn wait_started(&self, count: usize) {
        let mut rx = self.started.subscribe();
        rx.wait_for(|started| *started >= count).await.unwrap();
    }

    fn next_step(&self, index: usize) -> Step {
        self.script
            .lock()
            .unwrap()
            .get_mut(&index)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }

    async fn run_step(&self, request: &UnitRequest, cancel: &CancellationToken) -> UnitOutcome {
        match self.next_step(request.index) {
            Step::Block => {
                cancel.cancelled().await;
                UnitOutcome::Cancelled
            }
            Step::Transient(reason) => UnitOutcome::TransientFailure {
                reason: reason.to_string(),
            },
            Step::Fatal(reason) => UnitOutcome::FatalFailure {
                reason: reason.to_string(),
            },
            Step::Succeed => {
                tokio::select! {
                    _ = cancel.cancelled() => return UnitOutcome::Cancelled,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
                let duration_ms = request.range.len_ms();
                let body = media_body(duration_ms);
                tokio::fs::create_dir_all(request.staging.parent().unwrap())
                    .await
                    .unwrap();
                tokio::fs::write(&request.staging, &body).await.unwrap();
                tokio::fs::rename(&request.staging, &request.artifact)
                    .await
                    .unwrap();
                UnitOutcome::Success(ArtifactInfo {
                    path: request.artifact.clone(),
                    duration_ms,
                    bytes: body.len() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn probe(&self, path: &Path) -> Result<ProbeResult, TranscodeError> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TranscodeError::Probe(e.to_string()))?;
        let (kind, ms) = body
            .trim()
            .split_once(':')
            .ok_or_else(|| TranscodeError::Probe(format!("not fake media: {body:?}")))?;
        let duration_ms: u64 = ms
            .parse()
            .map_err(|_| TranscodeError::Probe(format!("bad duration: {ms:?}")))?;

        let video_streams = match kind {
            "video" => vec![VideoStream {
                index: 0,
                codec: "hevc".to_string(),
                width: 3840,
                height: 1920,
                frame_rate: "30/1".to_string(),
            }],
            _ => Vec::new(),
        };

        Ok(ProbeResult {
            info: MediaInfo {
                path: path.display().to_string(),
                format: "fake".to_string(),
                duration: duration_ms as f64 / 1000.0,
                size: body.len() as u64,
                bitrate: 0,
            },
            video_streams,
            audio_stream_count: 1,
        })
    }

    async fn transcode_unit(&self, request: &UnitRequest, cancel: CancellationToken) -> UnitOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((request.job_id.clone(), request.index));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.send_modify(|started| *started += 1);

        let outcome = self.run_step(request, &cancel).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn concatenate(
        &self,
        parts: &[PathBuf],
        list: &Path,
        output: &Path,
        cancel: CancellationToken,
    ) -> Result<(), TranscodeError> {
        if cancel.is_cancelled() {
            return Err(TranscodeError::Cancelled);
        }

        let mut listing = String::new();
        let mut total_ms = 0;
        for part in parts {
            listing.push_str(&format!("file '{}'\n", part.display()));
            total_ms += self.probe(part).await?.duration_ms();
        }
        tokio::fs::write(list, listing).await?;

        if self.short_output.load(Ordering::SeqCst) {
            total_ms /= 2;
        }
        tokio::fs::write(output, media_body(total_ms)).await?;
        Ok(())
    }
}

/// A temporary source/destination/state layout with a fake transcoder.
pub struct Harness {
    pub dir: TempDir,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub state_root: PathBuf,
    pub fake: Arc<FakeTranscoder>,
    pub store: Arc<FileProgressStore>,
}

impl Harness {
    /// Creates a harness whose source lasts `duration_ms`.
    pub fn new(duration_ms: u64) -> Self {
        Self::with_source_body(&media_body(duration_ms))
    }

    pub fn with_source_body(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.mp4");
        std::fs::write(&source, body).unwrap();
        let destination = dir.path().join("clip_equirect.mp4");
        let state_root = dir.path().join(".equirect");
        Self {
            source,
            destination,
            store: Arc::new(FileProgressStore::new(&state_root)),
            state_root,
            fake: FakeTranscoder::new(),
            dir,
        }
    }

    pub fn settings(&self, workers: usize, max_attempts: u32) -> EngineSettings {
        EngineSettings {
            state_root: self.state_root.clone(),
            workers_per_job: workers,
            max_concurrent_jobs: 1,
            max_attempts,
            unit_tolerance_ms: 500,
            output_tolerance_ms: 1000,
            min_artifact_bytes: 1,
            cleanup_artifacts: true,
        }
    }

    pub fn controller(&self, settings: EngineSettings) -> JobController {
        JobController::new(settings, self.fake.clone(), self.store.clone())
    }

    pub fn job(&self, chunk_ms: Option<u64>) -> Job {
        self.job_to(&self.destination, chunk_ms)
    }

    pub fn job_to(&self, destination: &Path, chunk_ms: Option<u64>) -> Job {
        Job::new(
            self.source.clone(),
            destination.to_path_buf(),
            ProjectionParams::default(),
            chunk_ms,
        )
    }

    /// Saves a freshly planned record for `job`, as a previous run would have.
    pub fn seed_record(&self, job: Job, duration_ms: u64, settings: &EngineSettings) -> ProgressRecord {
        let paths = settings.paths(&job.id);
        std::fs::create_dir_all(paths.work_dir()).unwrap();
        let units = plan_units(duration_ms, job.chunk_ms, &paths).unwrap();
        let bytes = std::fs::metadata(&self.source).unwrap().len();
        let record = ProgressRecord::new(job, duration_ms, bytes, units);
        self.store.save_blocking(&record).unwrap();
        record
    }

    /// Marks a seeded unit done and writes its artifact.
    pub fn seed_done_unit(&self, record: &mut ProgressRecord, index: usize, body: &str) {
        let unit = &mut record.units[index];
        std::fs::write(&unit.artifact, body).unwrap();
        unit.status = UnitStatus::Done;
        unit.attempts = 1;
        unit.elapsed_ms = Some(1_000);
        self.store.save_blocking(record).unwrap();
    }

    pub fn load(&self, job_id: &JobId) -> ProgressRecord {
        self.store.load_blocking(job_id).unwrap()
    }
}

/// Receives events for `job_id` until `stop` matches one.
pub async fn events_until(
    rx: &mut broadcast::Receiver<ProgressEvent>,
    job_id: &JobId,
    mut stop: impl FnMut(&EventKind) -> bool,
) -> Vec<EventKind> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if &event.job_id != job_id {
            continue;
        }
        let done = stop(&event.kind);
        seen.push(event.kind);
        if done {
            return seen;
        }
    }
}

/// Waits until unit `index` of `job_id` reports done.
pub async fn unit_done(rx: &mut broadcast::Receiver<ProgressEvent>, job_id: &JobId, index: usize) {
    events_until(rx, job_id, |kind| {
        matches!(
            kind,
            EventKind::UnitFinished { index: i, status: UnitStatus::Done, .. } if *i == index
        )
    })
    .await;
}
