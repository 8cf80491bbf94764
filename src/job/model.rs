//! Conversion job definitions.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Default field of view of the fisheye lenses, in degrees.
pub const DEFAULT_FOV: u32 = 190;

/// Stable identifier of a conversion job.
///
/// Derived from the source path and every parameter that changes the output,
/// including the encoder fingerprint, so re-running with identical arguments
/// finds the same progress record and changed settings never reuse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derives the id for a source/destination pair and conversion parameters.
    pub fn derive(
        source: &Path,
        destination: &Path,
        projection: &ProjectionParams,
        chunk_ms: Option<u64>,
        encoding: &str,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(destination.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(projection.filter_graph().as_bytes());
        hasher.update([0u8]);
        match chunk_ms {
            Some(ms) => hasher.update(ms.to_le_bytes()),
            None => hasher.update(b"whole"),
        }
        hasher.update([0u8]);
        hasher.update(encoding.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Wraps an existing id string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lens layout of the source frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InputLayout {
    /// Two fisheye views side by side in one frame.
    #[default]
    FisheyeSbs,
    /// A single fisheye view.
    Fisheye,
}

/// Projection of the converted frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputProjection {
    /// Half equirectangular (180 degree) per eye.
    #[default]
    #[value(name = "hequirect")]
    #[serde(rename = "hequirect")]
    HalfEquirect,
    /// Full equirectangular.
    #[value(name = "equirect")]
    #[serde(rename = "equirect")]
    Equirect,
}

/// Parameters of the fisheye to equirectangular mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionParams {
    pub layout: InputLayout,
    pub output: OutputProjection,
    /// Horizontal and vertical field of view of each lens, in degrees.
    pub fov: u32,
}

impl ProjectionParams {
    /// Creates projection parameters, rejecting a field of view outside 1-360.
    pub fn new(
        layout: InputLayout,
        output: OutputProjection,
        fov: u32,
    ) -> Result<Self, ValidationError> {
        if !(1..=360).contains(&fov) {
            return Err(ValidationError::InvalidFov { fov });
        }
        Ok(Self {
            layout,
            output,
            fov,
        })
    }

    /// Builds the ffmpeg `v360` filter description for these parameters.
    pub fn filter_graph(&self) -> String {
        let stereo = match self.layout {
            InputLayout::FisheyeSbs => "sbs",
            InputLayout::Fisheye => "2d",
        };
        let output = match self.output {
            OutputProjection::HalfEquirect => "hequirect",
            OutputProjection::Equirect => "equirect",
        };
        format!(
            "v360=input=fisheye:ih_fov={fov}:iv_fov={fov}:output={output}:in_stereo={stereo}:out_stereo={stereo}",
            fov = self.fov,
        )
    }
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            layout: InputLayout::default(),
            output: OutputProjection::default(),
            fov: DEFAULT_FOV,
        }
    }
}

/// A single source to destination conversion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable identifier for this job.
    pub id: JobId,

    /// Path to the source video.
    pub source: PathBuf,

    /// Path of the converted output video.
    pub destination: PathBuf,

    /// Projection parameters.
    pub projection: ProjectionParams,

    /// Target work unit length in milliseconds, `None` for a single unit.
    pub chunk_ms: Option<u64>,

    /// Fingerprint of the encoder settings the artifacts are produced with.
    #[serde(default)]
    pub encoding: String,

    /// Current status of the job.
    pub status: JobStatus,

    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,

    /// Timestamp when the job was last updated.
    pub updated_at: DateTime<Utc>,

    /// Structured reason if the job failed.
    pub failure: Option<FailureReport>,
}

impl Job {
    /// Creates a new pending job with the given parameters.
    pub fn new(
        source: PathBuf,
        destination: PathBuf,
        projection: ProjectionParams,
        chunk_ms: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::derive(&source, &destination, &projection, chunk_ms, ""),
            source,
            destination,
            projection,
            chunk_ms,
            encoding: String::new(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            failure: None,
        }
    }

    /// Binds the job to an encoder fingerprint and re-derives its id.
    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self.id = JobId::derive(
            &self.source,
            &self.destination,
            &self.projection,
            self.chunk_ms,
            &self.encoding,
        );
        self
    }

    /// Marks the job as running.
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.failure = None;
        self.updated_at = Utc::now();
    }

    /// Marks the job as paused at a resumable point.
    pub fn pause(&mut self) {
        self.status = JobStatus::Paused;
        self.updated_at = Utc::now();
    }

    /// Marks the job as cancelled by the user.
    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.updated_at = Utc::now();
    }

    /// Marks the job as completed successfully.
    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.failure = None;
        self.updated_at = Utc::now();
    }

    /// Marks the job as failed.
    pub fn fail(&mut self, report: FailureReport) {
        self.status = JobStatus::Failed;
        self.failure = Some(report);
        self.updated_at = Utc::now();
    }
}

/// Status of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is planned but has not started.
    Pending,
    /// Job is currently converting.
    Running,
    /// Job was interrupted at a resumable point.
    Paused,
    /// Job produced its output.
    Completed,
    /// Job failed; requires an explicit restart.
    Failed,
    /// Job was cancelled by the user.
    Cancelled,
}

impl JobStatus {
    /// Returns true if a plain resume may continue this job.
    ///
    /// Only failed jobs need an explicit restart. Resuming a completed job
    /// reports it done, or converts it again if its output went missing.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure taxonomy reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidDuration,
    StoreCorrupt,
    TransientFailure,
    FatalFailure,
    VerificationFailure,
    RetryExhausted,
}

/// Structured reason a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Kind of the last error.
    pub kind: ErrorKind,
    /// Work units the failure is attributed to.
    pub units: Vec<usize>,
    /// Human-readable description.
    pub message: String,
}

impl FailureReport {
    pub fn new(kind: ErrorKind, units: Vec<usize>, message: impl Into<String>) -> Self {
        Self {
            kind,
            units,
            message: message.into(),
        }
    }
}

impl From<&crate::error::EngineError> for FailureReport {
    fn from(err: &crate::error::EngineError) -> Self {
        Self::new(err.kind(), err.units(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_graph_matches_sbs_hequirect() {
        let params = ProjectionParams::default();
        assert_eq!(
            params.filter_graph(),
            "v360=input=fisheye:ih_fov=190:iv_fov=190:output=hequirect:in_stereo=sbs:out_stereo=sbs"
        );
    }

    #[test]
    fn mono_equirect_filter_graph() {
        let params =
            ProjectionParams::new(InputLayout::Fisheye, OutputProjection::Equirect, 200).unwrap();
        assert_eq!(
            params.filter_graph(),
            "v360=input=fisheye:ih_fov=200:iv_fov=200:output=equirect:in_stereo=2d:out_stereo=2d"
        );
    }

    #[test]
    fn fov_out_of_range_is_rejected() {
        assert!(ProjectionParams::new(InputLayout::FisheyeSbs, OutputProjection::Equirect, 0).is_err());
        assert!(ProjectionParams::new(InputLayout::FisheyeSbs, OutputProjection::Equirect, 361).is_err());
        assert!(ProjectionParams::new(InputLayout::FisheyeSbs, OutputProjection::Equirect, 360).is_ok());
    }

    #[test]
    fn job_id_is_stable_and_parameter_sensitive() {
        let src = PathBuf::from("/videos/in.mp4");
        let dst = PathBuf::from("/videos/out.mp4");
        let params = ProjectionParams::default();

        let a = JobId::derive(&src, &dst, &params, Some(60_000), "crf=18");
        let b = JobId::derive(&src, &dst, &params, Some(60_000), "crf=18");
        let c = JobId::derive(&src, &dst, &params, Some(30_000), "crf=18");
        let d = JobId::derive(&src, &dst, &params, None, "crf=18");
        let e = JobId::derive(&src, &dst, &params, Some(60_000), "crf=23");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, e);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn encoding_rebinds_the_job_id() {
        let job = Job::new(
            PathBuf::from("/videos/in.mp4"),
            PathBuf::from("/videos/out.mp4"),
            ProjectionParams::default(),
            Some(60_000),
        );
        let plain = job.id.clone();
        let encoded = job.with_encoding("c:v=libx265;crf=18");

        assert_ne!(encoded.id, plain);
        assert_eq!(encoded.encoding, "c:v=libx265;crf=18");
        assert_eq!(
            encoded.id,
            JobId::derive(
                &encoded.source,
                &encoded.destination,
                &encoded.projection,
                encoded.chunk_ms,
                "c:v=libx265;crf=18"
            )
        );
    }

    #[test]
    fn only_failed_jobs_refuse_resume() {
        assert!(JobStatus::Paused.is_resumable());
        assert!(JobStatus::Running.is_resumable());
        assert!(JobStatus::Cancelled.is_resumable());
        assert!(JobStatus::Completed.is_resumable());
        assert!(!JobStatus::Failed.is_resumable());
    }
}
