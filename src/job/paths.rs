//! On-disk layout of a job's state and intermediate files.

use std::path::{Path, PathBuf};

use super::model::JobId;

/// Name of the state directory created next to the output when no
/// `global.state_dir` is configured.
pub const DEFAULT_STATE_DIR_NAME: &str = ".equirect";

/// Extension of partial artifacts and the concatenated output staging file.
pub const ARTIFACT_EXTENSION: &str = "mp4";

/// Resolves the state root for a destination path.
pub fn default_state_root(destination: &Path) -> PathBuf {
    destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join(DEFAULT_STATE_DIR_NAME)
}

/// Paths of one job's working files under a state root.
#[derive(Debug, Clone)]
pub struct JobPaths {
    work_dir: PathBuf,
}

impl JobPaths {
    pub fn new(state_root: &Path, job_id: &JobId) -> Self {
        Self {
            work_dir: state_root.join(job_id.as_str()),
        }
    }

    /// Directory holding partial artifacts.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// File name of a unit's promoted artifact.
    pub fn unit_file_name(index: usize) -> String {
        format!("unit-{index:05}.{ARTIFACT_EXTENSION}")
    }

    /// Final partial artifact path for a unit.
    pub fn unit_artifact(&self, index: usize) -> PathBuf {
        self.work_dir.join(Self::unit_file_name(index))
    }

    /// Staging path a unit is written to before promotion.
    pub fn unit_staging(&self, index: usize) -> PathBuf {
        self.work_dir
            .join(format!("unit-{index:05}.partial.{ARTIFACT_EXTENSION}"))
    }

    /// Concat demuxer list file.
    pub fn concat_list(&self) -> PathBuf {
        self.work_dir.join("concat.txt")
    }

    /// Glob pattern matching leftover staging files.
    pub fn staging_pattern(&self) -> String {
        format!("{}/*.partial.*", glob::Pattern::escape(&self.work_dir.to_string_lossy()))
    }
}

/// Staging path for the concatenated output, in the destination directory so
/// the final rename never crosses filesystems.
pub fn output_staging(destination: &Path) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let ext = destination
        .extension()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| ARTIFACT_EXTENSION.to_string());
    destination.with_file_name(format!("{stem}.partial.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_root_sits_next_to_output() {
        assert_eq!(
            default_state_root(Path::new("/out/movie.mp4")),
            PathBuf::from("/out/.equirect")
        );
        assert_eq!(
            default_state_root(Path::new("movie.mp4")),
            PathBuf::from("./.equirect")
        );
    }

    #[test]
    fn unit_paths_are_zero_padded() {
        let paths = JobPaths::new(Path::new("/state"), &JobId::from_string("abc"));
        assert_eq!(paths.unit_artifact(3), PathBuf::from("/state/abc/unit-00003.mp4"));
        assert_eq!(
            paths.unit_staging(3),
            PathBuf::from("/state/abc/unit-00003.partial.mp4")
        );
    }

    #[test]
    fn output_staging_keeps_extension() {
        assert_eq!(
            output_staging(Path::new("/out/movie.mkv")),
            PathBuf::from("/out/movie.partial.mkv")
        );
    }
}
