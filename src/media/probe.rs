//! FFprobe wrapper for media analysis.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::TranscodeError;

/// Result of probing a media file.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// General media information.
    pub info: MediaInfo,
    /// Video streams in the file.
    pub video_streams: Vec<VideoStream>,
    /// Number of audio streams in the file.
    pub audio_stream_count: usize,
}

impl ProbeResult {
    /// Duration in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        crate::planner::duration_ms_from_secs(self.info.duration)
    }
}

/// General media file information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    /// File path.
    pub path: String,
    /// Container format.
    pub format: String,
    /// Duration in seconds.
    pub duration: f64,
    /// File size in bytes.
    pub size: u64,
    /// Overall bitrate in bits per second.
    pub bitrate: u64,
}

/// Video stream information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoStream {
    /// Stream index.
    pub index: usize,
    /// Codec name.
    pub codec: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Frame rate as a string (e.g., "30000/1001").
    pub frame_rate: String,
}

impl VideoStream {
    /// Returns true if the frame is roughly twice as wide as it is tall, as
    /// expected for two fisheye views side by side.
    pub fn looks_side_by_side(&self) -> bool {
        if self.height == 0 {
            return false;
        }
        let aspect = self.width as f64 / self.height as f64;
        (1.8..=2.2).contains(&aspect)
    }
}

/// Probes a media file using ffprobe.
pub async fn probe(ffprobe: &Path, path: &Path) -> Result<ProbeResult, TranscodeError> {
    let output = Command::new(ffprobe)
        .args([
            "-v", "quiet",
            "-print_format", "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TranscodeError::ToolNotFound {
                program: ffprobe.display().to_string(),
            },
            _ => TranscodeError::SpawnFailed {
                program: ffprobe.display().to_string(),
                source: e,
            },
        })?;

    if !output.status.success() {
        return Err(TranscodeError::Probe(format!(
            "ffprobe exited with {:?} for '{}'",
            output.status.code(),
            path.display()
        )));
    }

    let json: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| TranscodeError::Probe(format!("failed to parse ffprobe output: {e}")))?;

    parse_probe_output(&json, path)
}

/// Parses ffprobe JSON output into structured data.
pub fn parse_probe_output(json: &serde_json::Value, path: &Path) -> Result<ProbeResult, TranscodeError> {
    let format = json
        .get("format")
        .ok_or_else(|| TranscodeError::Probe("missing format in ffprobe output".to_string()))?;
    let streams = json
        .get("streams")
        .and_then(|s| s.as_array())
        .ok_or_else(|| TranscodeError::Probe("missing streams in ffprobe output".to_string()))?;

    let info = MediaInfo {
        path: path.to_string_lossy().to_string(),
        format: format.get("format_name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        duration: format.get("duration")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0),
        size: format.get("size")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        bitrate: format.get("bit_rate")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    };

    let mut video_streams = Vec::new();
    let mut audio_stream_count = 0;

    for stream in streams {
        match stream.get("codec_type").and_then(|v| v.as_str()) {
            Some("video") => {
                // Cover art is reported as a video stream
                let attached_pic = stream
                    .get("disposition")
                    .and_then(|d| d.get("attached_pic"))
                    .and_then(|v| v.as_i64())
                    == Some(1);
                if attached_pic {
                    continue;
                }
                if let Some(vs) = parse_video_stream(stream) {
                    video_streams.push(vs);
                }
            }
            Some("audio") => audio_stream_count += 1,
            _ => {}
        }
    }

    Ok(ProbeResult {
        info,
        video_streams,
        audio_stream_count,
    })
}

/// Parses a video stream from ffprobe JSON.
fn parse_video_stream(stream: &serde_json::Value) -> Option<VideoStream> {
    Some(VideoStream {
        index: stream.get("index")?.as_u64()? as usize,
        codec: stream.get("codec_name")?.as_str()?.to_string(),
        width: stream.get("width")?.as_u64()? as u32,
        height: stream.get("height")?.as_u64()? as u32,
        frame_rate: stream.get("r_frame_rate")
            .and_then(|v| v.as_str())
            .unwrap_or("0/1")
            .to_string(),
    })
}
