//! Configuration data structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::job::{InputLayout, OutputProjection};

/// Root configuration structure containing all settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Global application settings.
    #[serde(default)]
    pub global: GlobalConfig,

    /// External transcoder settings.
    #[serde(default)]
    pub transcoder: TranscoderConfig,

    /// Default projection parameters.
    #[serde(default)]
    pub projection: ProjectionConfig,

    /// Work unit sizing.
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Worker pool bounds.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Retry settings for failed units.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Artifact sanity checks.
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Prometheus metrics settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

/// Global application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for progress records and partial artifacts. Defaults to a
    /// `.equirect` directory next to the output.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// External transcoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Path or name of the ffmpeg binary.
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,

    /// Path or name of the ffprobe binary.
    #[serde(default = "default_ffprobe")]
    pub ffprobe_path: PathBuf,

    /// FFmpeg video encoder.
    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    /// Constant rate factor passed to the encoder.
    #[serde(default = "default_crf")]
    pub crf: u8,

    /// Output pixel format.
    #[serde(default = "default_pix_fmt")]
    pub pix_fmt: String,

    /// Optional encoder preset.
    #[serde(default)]
    pub preset: Option<String>,

    /// FFmpeg audio encoder.
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    /// Per-invocation timeout; none means unlimited.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Seconds between SIGTERM and SIGKILL when stopping a transcoder.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_seconds: u64,
}

/// Default projection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    #[serde(default)]
    pub layout: InputLayout,

    #[serde(default)]
    pub output: OutputProjection,

    /// Lens field of view in degrees.
    #[serde(default = "default_fov")]
    pub fov: u32,
}

/// Work unit sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target unit length in seconds; `null` converts the file as one unit.
    #[serde(default = "default_chunk_seconds")]
    pub chunk_seconds: Option<f64>,
}

/// Worker pool bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Units converted in parallel within one job.
    #[serde(default = "default_workers_per_job")]
    pub workers_per_job: usize,

    /// Jobs converted in parallel.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

/// Retry configuration for failed units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per unit (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Artifact sanity checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Allowed drift between a unit's range and its artifact duration.
    #[serde(default = "default_unit_tolerance_ms")]
    pub unit_tolerance_ms: u64,

    /// Allowed drift between the source and the final output duration.
    #[serde(default = "default_output_tolerance_ms")]
    pub output_tolerance_ms: u64,

    /// Smallest artifact size accepted as non-truncated.
    #[serde(default = "default_min_artifact_bytes")]
    pub min_artifact_bytes: u64,

    /// Remove partial artifacts once the output is verified.
    #[serde(default = "default_true")]
    pub cleanup_artifacts: bool,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Whether to serve the Prometheus metrics endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Port for the Prometheus metrics HTTP server.
    #[serde(default = "default_prometheus_port")]
    pub port: u16,
}

impl ChunkingConfig {
    /// Chunk length in whole milliseconds.
    pub fn chunk_ms(&self) -> Option<u64> {
        self.chunk_seconds.map(|s| (s * 1000.0).round().max(0.0) as u64)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_video_codec() -> String {
    "libx265".to_string()
}

fn default_crf() -> u8 {
    18
}

fn default_pix_fmt() -> String {
    "yuv420p".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_kill_grace() -> u64 {
    5
}

fn default_fov() -> u32 {
    crate::job::model::DEFAULT_FOV
}

fn default_chunk_seconds() -> Option<f64> {
    Some(60.0)
}

fn default_workers_per_job() -> usize {
    // x265 is itself multithreaded; a few parallel units saturate most CPUs
    (num_cpus::get() / 4).clamp(1, 4)
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_unit_tolerance_ms() -> u64 {
    500
}

fn default_output_tolerance_ms() -> u64 {
    1000
}

fn default_min_artifact_bytes() -> u64 {
    1
}

fn default_prometheus_port() -> u16 {
    9898
}

fn default_true() -> bool {
    true
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_dir: None,
        }
    }
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            ffprobe_path: default_ffprobe(),
            video_codec: default_video_codec(),
            crf: default_crf(),
            pix_fmt: default_pix_fmt(),
            preset: None,
            audio_codec: default_audio_codec(),
            timeout_seconds: None,
            kill_grace_seconds: default_kill_grace(),
        }
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            layout: InputLayout::default(),
            output: OutputProjection::default(),
            fov: default_fov(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: default_chunk_seconds(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers_per_job: default_workers_per_job(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            unit_tolerance_ms: default_unit_tolerance_ms(),
            output_tolerance_ms: default_output_tolerance_ms(),
            min_artifact_bytes: default_min_artifact_bytes(),
            cleanup_artifacts: true,
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_prometheus_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.transcoder.video_codec, "libx265");
        assert_eq!(config.transcoder.crf, 18);
        assert_eq!(config.projection.fov, 190);
        assert_eq!(config.chunking.chunk_ms(), Some(60_000));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.concurrency.workers_per_job >= 1);
        assert!(!config.prometheus.enabled);
    }

    #[test]
    fn null_chunk_disables_chunking() {
        let config: AppConfig = serde_yaml::from_str("chunking:\n  chunk_seconds: null\n").unwrap();
        assert_eq!(config.chunking.chunk_ms(), None);
    }

    #[test]
    fn parses_projection_names() {
        let yaml = "projection:\n  layout: fisheye\n  output: equirect\n  fov: 200\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.projection.layout, InputLayout::Fisheye);
        assert_eq!(config.projection.output, OutputProjection::Equirect);
        assert_eq!(config.projection.fov, 200);
    }
}
