//! Command-line interface definitions.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::job::{InputLayout, OutputProjection};

/// Resumable side-by-side fisheye to equirectangular video converter.
#[derive(Parser, Debug)]
#[command(name = "equirect", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file. A missing file at the default path
    /// means built-in defaults.
    #[arg(
        short,
        long,
        default_value = DEFAULT_CONFIG_PATH,
        env = "EQUIRECT_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Config path used when neither `--config` nor `EQUIRECT_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "equirect.yaml";

impl Cli {
    /// Returns the log level from the verbosity flags, falling back to the
    /// configured level.
    pub fn log_level<'a>(&self, configured: &'a str) -> &'a str {
        match self.verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    }

    /// True when the config path is the implicit default, which may be absent.
    pub fn config_is_optional(&self) -> bool {
        self.config.as_os_str() == DEFAULT_CONFIG_PATH
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Compact human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert a fisheye recording to equirectangular video.
    Convert(ConvertArgs),

    /// Show the stored progress of conversion jobs.
    Status(StatusArgs),

    /// Validate the configuration file and toolchain.
    #[command(name = "config-validate")]
    ConfigValidate,

    /// Display the parsed configuration.
    #[command(name = "config-show")]
    ConfigShow,
}

/// Arguments for the convert subcommand.
#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    /// Source recording.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Destination file.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Lens layout of the source.
    #[arg(long, value_enum)]
    pub layout: Option<InputLayout>,

    /// Projection of the output.
    #[arg(long, value_enum)]
    pub projection: Option<OutputProjection>,

    /// Lens field of view in degrees.
    #[arg(long)]
    pub fov: Option<u32>,

    /// Continue a previous run of the same conversion instead of starting over.
    #[arg(long, default_value = "false")]
    pub resume: bool,

    /// Target work unit length in seconds.
    #[arg(long, conflicts_with = "no_chunking")]
    pub chunk_seconds: Option<f64>,

    /// Convert the whole file as a single unit.
    #[arg(long, default_value = "false")]
    pub no_chunking: bool,

    /// Units converted in parallel.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Maximum attempts per unit.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Directory for progress records and partial artifacts.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

impl ConvertArgs {
    /// Applies command-line overrides on top of the file configuration.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(layout) = self.layout {
            config.projection.layout = layout;
        }
        if let Some(projection) = self.projection {
            config.projection.output = projection;
        }
        if let Some(fov) = self.fov {
            config.projection.fov = fov;
        }
        if self.no_chunking {
            config.chunking.chunk_seconds = None;
        } else if let Some(seconds) = self.chunk_seconds {
            config.chunking.chunk_seconds = Some(seconds);
        }
        if let Some(workers) = self.concurrency {
            config.concurrency.workers_per_job = workers;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(dir) = &self.state_dir {
            config.global.state_dir = Some(dir.clone());
        }
    }
}

/// Arguments for the status subcommand.
#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// Only show this job.
    pub job_id: Option<String>,

    /// Directory holding progress records.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Locate the state directory next to this output file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_flags_override_config() {
        let cli = Cli::parse_from([
            "equirect",
            "convert",
            "--input",
            "in.mp4",
            "--output",
            "out.mp4",
            "--layout",
            "fisheye",
            "--projection",
            "equirect",
            "--no-chunking",
            "--concurrency",
            "2",
            "--max-attempts",
            "5",
        ]);
        let Commands::Convert(args) = cli.command else {
            panic!("expected convert");
        };

        let mut config = AppConfig::default();
        args.apply(&mut config);
        assert_eq!(config.projection.layout, InputLayout::Fisheye);
        assert_eq!(config.projection.output, OutputProjection::Equirect);
        assert_eq!(config.chunking.chunk_seconds, None);
        assert_eq!(config.concurrency.workers_per_job, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!args.resume);
    }

    #[test]
    fn chunk_seconds_conflicts_with_no_chunking() {
        let result = Cli::try_parse_from([
            "equirect",
            "convert",
            "-i",
            "in.mp4",
            "-o",
            "out.mp4",
            "--chunk-seconds",
            "30",
            "--no-chunking",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn verbosity_overrides_configured_level() {
        let cli = Cli::parse_from(["equirect", "-vv", "config-show"]);
        assert_eq!(cli.log_level("warn"), "trace");
        let cli = Cli::parse_from(["equirect", "config-show"]);
        assert_eq!(cli.log_level("warn"), "warn");
    }
}
