//! FFmpeg subprocess wrapper for projection conversion and concatenation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::concat::write_concat_list;
use super::process::{run_cancellable, ProcessExit};
use super::{verify_artifact, ArtifactCheck, Transcoder, UnitOutcome, UnitRequest};
use crate::config::AppConfig;
use crate::error::TranscodeError;
use crate::media::{probe, ProbeResult};

/// Settings for the ffmpeg-backed transcoder.
#[derive(Debug, Clone)]
pub struct TranscoderSettings {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub video_codec: String,
    pub crf: u8,
    pub pix_fmt: String,
    pub preset: Option<String>,
    pub audio_codec: String,
    /// Per-invocation timeout.
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    pub unit_tolerance_ms: u64,
    pub min_artifact_bytes: u64,
}

impl TranscoderSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let t = &config.transcoder;
        Self {
            ffmpeg: t.ffmpeg_path.clone(),
            ffprobe: t.ffprobe_path.clone(),
            video_codec: t.video_codec.clone(),
            crf: t.crf,
            pix_fmt: t.pix_fmt.clone(),
            preset: t.preset.clone(),
            audio_codec: t.audio_codec.clone(),
            timeout: t.timeout_seconds.map(Duration::from_secs),
            kill_grace: Duration::from_secs(t.kill_grace_seconds),
            unit_tolerance_ms: config.verification.unit_tolerance_ms,
            min_artifact_bytes: config.verification.min_artifact_bytes,
        }
    }
}

impl TranscoderSettings {
    /// Identifies every encoder option that shapes a unit's artifact.
    ///
    /// Artifacts encoded under one fingerprint cannot be concatenated with
    /// artifacts from another, so it is part of the job id.
    pub fn fingerprint(&self) -> String {
        format!(
            "c:v={};crf={};pix_fmt={};preset={};c:a={}",
            self.video_codec,
            self.crf,
            self.pix_fmt,
            self.preset.as_deref().unwrap_or("default"),
            self.audio_codec
        )
    }
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Transcoder that shells out to ffmpeg and ffprobe.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    settings: TranscoderSettings,
}

impl FfmpegTranscoder {
    pub fn new(settings: TranscoderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TranscoderSettings {
        &self.settings
    }

    fn program(&self) -> String {
        self.settings.ffmpeg.to_string_lossy().into_owned()
    }

    /// Sanity-checks the staged file and renames it over the artifact path.
    async fn promote(&self, request: &UnitRequest) -> UnitOutcome {
        let check = ArtifactCheck {
            expected_ms: request.range.len_ms(),
            tolerance_ms: self.settings.unit_tolerance_ms,
            min_bytes: self.settings.min_artifact_bytes,
        };

        let info = match verify_artifact(self, &request.staging, &check).await {
            Ok(info) => info,
            Err(reason) => {
                remove_quietly(&request.staging).await;
                return UnitOutcome::TransientFailure { reason };
            }
        };

        if let Err(e) = tokio::fs::rename(&request.staging, &request.artifact).await {
            remove_quietly(&request.staging).await;
            return UnitOutcome::TransientFailure {
                reason: format!("failed to promote artifact: {e}"),
            };
        }

        UnitOutcome::Success(super::ArtifactInfo {
            path: request.artifact.clone(),
            ..info
        })
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn probe(&self, path: &Path) -> Result<ProbeResult, TranscodeError> {
        probe::probe(&self.settings.ffprobe, path).await
    }

    async fn transcode_unit(&self, request: &UnitRequest, cancel: CancellationToken) -> UnitOutcome {
        if let Some(parent) = request.staging.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return UnitOutcome::TransientFailure {
                    reason: format!("failed to create '{}': {e}", parent.display()),
                };
            }
        }

        let mut cmd = Command::new(&self.settings.ffmpeg);
        cmd.args(unit_args(&self.settings, request));

        info!(
            job_id = %request.job_id,
            unit = request.index,
            start_ms = request.range.start_ms,
            end_ms = request.range.end_ms,
            "Starting ffmpeg unit"
        );
        debug!(cmd = ?cmd, "Running ffmpeg");

        let started = Instant::now();
        let exit = run_cancellable(
            cmd,
            &self.program(),
            &cancel,
            self.settings.timeout,
            self.settings.kill_grace,
        )
        .await;

        let outcome = match exit {
            Err(TranscodeError::ToolNotFound { program }) => UnitOutcome::FatalFailure {
                reason: TranscodeError::ToolNotFound { program }.to_string(),
            },
            Err(e) => UnitOutcome::TransientFailure {
                reason: e.to_string(),
            },
            Ok(ProcessExit::Cancelled) => UnitOutcome::Cancelled,
            Ok(ProcessExit::TimedOut) => UnitOutcome::TransientFailure {
                reason: TranscodeError::Timeout {
                    seconds: self.settings.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                }
                .to_string(),
            },
            Ok(ProcessExit::Exited { status, stderr_tail }) if !status.success() => {
                let reason = TranscodeError::Failed {
                    code: status.code(),
                    stderr: stderr_tail.clone(),
                }
                .to_string();
                classify_failure(status.code(), &stderr_tail, reason)
            }
            Ok(ProcessExit::Exited { .. }) => self.promote(request).await,
        };

        match &outcome {
            UnitOutcome::Success(info) => info!(
                job_id = %request.job_id,
                unit = request.index,
                bytes = info.bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "ffmpeg unit completed"
            ),
            UnitOutcome::Cancelled => {
                remove_quietly(&request.staging).await;
                debug!(job_id = %request.job_id, unit = request.index, "ffmpeg unit cancelled");
            }
            UnitOutcome::TransientFailure { reason } | UnitOutcome::FatalFailure { reason } => {
                remove_quietly(&request.staging).await;
                warn!(job_id = %request.job_id, unit = request.index, reason = %reason, "ffmpeg unit failed");
            }
        }

        outcome
    }

    async fn concatenate(
        &self,
        parts: &[PathBuf],
        list: &Path,
        output: &Path,
        cancel: CancellationToken,
    ) -> Result<(), TranscodeError> {
        write_concat_list(list, parts).await?;

        let mut cmd = Command::new(&self.settings.ffmpeg);
        cmd.args(concat_args(list, output));

        info!(parts = parts.len(), output = ?output, "Concatenating artifacts");
        debug!(cmd = ?cmd, "Running ffmpeg concat");

        let exit = run_cancellable(
            cmd,
            &self.program(),
            &cancel,
            self.settings.timeout,
            self.settings.kill_grace,
        )
        .await?;

        match exit {
            ProcessExit::Exited { status, .. } if status.success() => Ok(()),
            ProcessExit::Exited { status, stderr_tail } => Err(TranscodeError::Failed {
                code: status.code(),
                stderr: stderr_tail,
            }),
            ProcessExit::Cancelled => Err(TranscodeError::Cancelled),
            ProcessExit::TimedOut => Err(TranscodeError::Timeout {
                seconds: self.settings.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            }),
        }
    }
}

/// Builds the ffmpeg arguments for one unit.
///
/// `-ss` before `-i` seeks the input accurately when re-encoding, so each
/// unit starts at its exact range boundary.
pub fn unit_args(settings: &TranscoderSettings, request: &UnitRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]
        .iter()
        .map(OsString::from)
        .collect();

    args.push("-ss".into());
    args.push(format_timestamp(request.range.start_ms).into());
    args.push("-i".into());
    args.push(request.source.clone().into_os_string());
    args.push("-t".into());
    args.push(format_timestamp(request.range.len_ms()).into());

    args.push("-filter:v".into());
    args.push(request.projection.filter_graph().into());

    args.push("-map".into());
    args.push("0:v:0".into());
    args.push("-map".into());
    args.push("0:a?".into());

    args.push("-c:v".into());
    args.push(settings.video_codec.clone().into());
    args.push("-crf".into());
    args.push(settings.crf.to_string().into());
    args.push("-pix_fmt".into());
    args.push(settings.pix_fmt.clone().into());
    if let Some(preset) = &settings.preset {
        args.push("-preset".into());
        args.push(preset.clone().into());
    }
    args.push("-c:a".into());
    args.push(settings.audio_codec.clone().into());

    args.push(request.staging.clone().into_os_string());
    args
}

/// Builds the ffmpeg arguments for a stream-copy concatenation.
pub fn concat_args(list: &Path, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-f", "concat", "-safe", "0", "-i",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(list.as_os_str().to_owned());
    for arg in ["-map", "0", "-c", "copy"] {
        args.push(arg.into());
    }
    args.push(output.as_os_str().to_owned());
    args
}

/// Formats milliseconds as `seconds.millis` for ffmpeg time options.
pub fn format_timestamp(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

fn fatal_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(unknown encoder|no such filter|invalid data found|unsupported codec|does not contain any stream|invalid argument|option not found|error initializing filter|no such file or directory|decoder \S+ not found|matches no streams)",
            )
            .ok()
        })
        .as_ref()
}

/// True if an ffmpeg exit was caused by the input or the toolchain. Deaths
/// by signal never are.
pub fn is_fatal_exit(code: Option<i32>, stderr: &str) -> bool {
    code.is_some() && fatal_pattern().is_some_and(|p| p.is_match(stderr))
}

/// Decides whether a non-zero ffmpeg exit is worth retrying.
///
/// Exits caused by the input or the toolchain are fatal; anything else
/// (killed by a signal, I/O hiccups, crashes) is transient.
pub fn classify_failure(code: Option<i32>, stderr: &str, reason: String) -> UnitOutcome {
    if is_fatal_exit(code, stderr) {
        UnitOutcome::FatalFailure { reason }
    } else {
        UnitOutcome::TransientFailure { reason }
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = ?path, error = %e, "Failed to remove staging file"),
    }
}
