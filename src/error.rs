//! Error types for the conversion engine.

use std::path::PathBuf;
use thiserror::Error;

use crate::job::ErrorKind;

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },
}

/// Job argument validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Field of view {fov} is out of range (1-360)")]
    InvalidFov { fov: u32 },

    #[error("Job rejected with {error_count} error(s)")]
    JobRejected { error_count: usize },
}

/// Capability detection errors.
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("Failed to run '{command}': {message}")]
    CommandFailed { command: String, message: String },

    #[error("Required tool '{tool}' not found in PATH")]
    ToolNotFound { tool: String },
}

/// Segment planning errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Invalid source duration: {duration_ms} ms")]
    InvalidDuration { duration_ms: u64 },

    #[error("Chunk length must be greater than zero")]
    InvalidChunkLength,
}

/// Progress store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No progress record for job {job_id}")]
    NotFound { job_id: String },

    #[error("Progress record '{path}' is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Progress store I/O failed on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Job {job_id} has no work unit {index}")]
    UnitOutOfRange { job_id: String, index: usize },

    #[error("Progress store task failed: {0}")]
    TaskFailed(String),
}

/// Errors raised while driving the external transcoder.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("'{program}' not found; reinstall ffmpeg or fix transcoder.ffmpeg_path")]
    ToolNotFound { program: String },

    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("Transcoder failed with exit code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Transcoder timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Transcoder was cancelled")]
    Cancelled,

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    /// True for failures a retry cannot fix: a missing program, or an exit
    /// whose stderr blames the input or the toolchain.
    pub fn is_fatal(&self) -> bool {
        match self {
            TranscodeError::ToolNotFound { .. } => true,
            TranscodeError::Failed { code, stderr } => {
                crate::encoder::ffmpeg::is_fatal_exit(*code, stderr)
            }
            _ => false,
        }
    }
}

/// Errors that terminate a conversion job.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Source duration is invalid ({duration_ms} ms)")]
    InvalidDuration { duration_ms: u64 },

    #[error("Progress record '{path}' is corrupt: {message}")]
    StoreCorrupt { path: PathBuf, message: String },

    #[error("Progress store error: {0}")]
    Store(StoreError),

    #[error("Fatal transcoder failure{}: {message}", .unit.map(|u| format!(" on unit {u}")).unwrap_or_default())]
    Fatal { unit: Option<usize>, message: String },

    #[error("Output verification failed: {message}")]
    Verification { message: String },

    #[error("Unit {unit} exhausted {attempts} attempt(s); last error: {last_error}")]
    RetryExhausted {
        unit: usize,
        attempts: u32,
        last_error: String,
    },

    #[error("Concatenation exhausted {attempts} attempt(s); last error: {last_error}")]
    ConcatExhausted { attempts: u32, last_error: String },

    #[error("Job {job_id} not found")]
    JobNotFound { job_id: String },

    #[error("Job {job_id} is already running")]
    AlreadyRunning { job_id: String },

    #[error("Job {job_id} cannot be resumed from status {status}")]
    InvalidState { job_id: String, status: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Maps this error onto the user-visible failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidDuration { .. } => ErrorKind::InvalidDuration,
            EngineError::StoreCorrupt { .. } => ErrorKind::StoreCorrupt,
            EngineError::Fatal { .. } => ErrorKind::FatalFailure,
            EngineError::Verification { .. } => ErrorKind::VerificationFailure,
            EngineError::RetryExhausted { .. } | EngineError::ConcatExhausted { .. } => {
                ErrorKind::RetryExhausted
            }
            EngineError::Store(_) => ErrorKind::TransientFailure,
            EngineError::JobNotFound { .. }
            | EngineError::AlreadyRunning { .. }
            | EngineError::InvalidState { .. }
            | EngineError::Internal(_) => ErrorKind::FatalFailure,
        }
    }

    /// Returns the unit indices this error is attributed to.
    pub fn units(&self) -> Vec<usize> {
        match self {
            EngineError::Fatal { unit: Some(u), .. } => vec![*u],
            EngineError::RetryExhausted { unit, .. } => vec![*unit],
            _ => Vec::new(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { path, message } => EngineError::StoreCorrupt { path, message },
            other => EngineError::Store(other),
        }
    }
}

impl From<PlanError> for EngineError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::InvalidDuration { duration_ms } => EngineError::InvalidDuration { duration_ms },
            PlanError::InvalidChunkLength => EngineError::Fatal {
                unit: None,
                message: err.to_string(),
            },
        }
    }
}

/// Notification sending errors.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Prometheus metrics export failed: {0}")]
    PrometheusFailed(String),
}
