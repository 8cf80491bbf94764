//! Equirect Pipeline - resumable fisheye to equirectangular video conversion.
//!
//! Recordings are split into time-ranged work units that are converted by
//! ffmpeg in parallel, tracked in a durable progress record and concatenated
//! into the final output. An interrupted conversion resumes from the last
//! completed unit.

pub mod cli;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod encoder;
pub mod error;
pub mod job;
pub mod media;
pub mod notify;
pub mod planner;
pub mod store;
pub mod validation;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Commands, ConvertArgs, LogFormat, StatusArgs};
use crate::config::AppConfig;
use crate::controller::events::{percent_for, EventKind, ProgressEvent};
use crate::controller::JobController;
use crate::coordinator::{CoordinatorState, EngineSettings, RunOutcome};
use crate::encoder::{FfmpegTranscoder, TranscoderSettings};
use crate::error::{EngineError, ValidationError};
use crate::job::paths::default_state_root;
use crate::job::{Job, JobId, JobStatus, ProjectionParams};
use crate::notify::{Metrics, MetricsServer};
use crate::planner::UnitStatus;
use crate::store::{FileProgressStore, ProgressRecord, ProgressStore};
use crate::validation::{report, SystemCapabilities};

/// Exit code of a run interrupted with Ctrl-C.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Runs the command selected on the command line.
pub async fn run(cli: Cli) -> Result<ExitCode> {
    let config = config::loader::load_or_default(&cli.config, cli.config_is_optional())
        .context("Failed to load configuration")?;

    match &cli.command {
        Commands::Convert(args) => {
            let mut config = config;
            args.apply(&mut config);
            setup_logging(cli.log_level(&config.global.log_level), cli.log_format)?;
            convert(args, config).await
        }
        Commands::Status(args) => {
            setup_logging(cli.log_level(&config.global.log_level), cli.log_format)?;
            show_status(args, &config).await
        }
        Commands::ConfigValidate => {
            setup_logging(cli.log_level(&config.global.log_level), cli.log_format)?;
            validate_config(&config)
        }
        Commands::ConfigShow => {
            setup_logging(cli.log_level(&config.global.log_level), cli.log_format)?;
            config::loader::ensure_valid(&config, None)?;
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Initializes the tracing subscriber for structured logging.
///
/// `RUST_LOG` takes precedence over `level`.
fn setup_logging(level: &str, format: LogFormat) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let installed = match format {
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

/// Maps a job failure onto the process exit code.
pub fn exit_code_for(err: &EngineError) -> u8 {
    match err {
        EngineError::Fatal { .. } | EngineError::InvalidDuration { .. } => 2,
        EngineError::RetryExhausted { .. } | EngineError::ConcatExhausted { .. } => 3,
        EngineError::Verification { .. } => 4,
        EngineError::StoreCorrupt { .. } => 5,
        _ => 1,
    }
}

/// Converts one recording, resuming a previous run when asked to.
async fn convert(args: &ConvertArgs, config: AppConfig) -> Result<ExitCode> {
    let capabilities = SystemCapabilities::detect(&config.transcoder.ffmpeg_path)?;
    debug!(
        encoders = capabilities.available_encoders.len(),
        filters = capabilities.available_filters.len(),
        "Detected ffmpeg capabilities"
    );
    config::loader::ensure_valid(&config, Some(&capabilities))?;

    let checked = validation::validate_job(&args.input, &args.output);
    for issue in checked.warnings() {
        warn!(path = %issue.path, message = %issue.message, "Job validation warning");
    }
    if !checked.is_valid() {
        eprint!("{}", report::format_report(&checked));
        return Err(ValidationError::JobRejected {
            error_count: checked.error_count(),
        }
        .into());
    }

    let source = std::fs::canonicalize(&args.input)
        .with_context(|| format!("Failed to resolve input '{}'", args.input.display()))?;
    let destination = absolute_destination(&args.output)?;
    let projection = ProjectionParams::new(
        config.projection.layout,
        config.projection.output,
        config.projection.fov,
    )?;
    let transcoder_settings = TranscoderSettings::from_config(&config);
    let job = Job::new(source, destination, projection, config.chunking.chunk_ms())
        .with_encoding(transcoder_settings.fingerprint());

    let state_root = config
        .global
        .state_dir
        .clone()
        .unwrap_or_else(|| default_state_root(&job.destination));
    let settings = EngineSettings::from_config(&config, &state_root);
    let transcoder = Arc::new(FfmpegTranscoder::new(transcoder_settings));
    let store = Arc::new(FileProgressStore::new(&state_root));
    let controller = JobController::new(settings, transcoder, store);

    if config.prometheus.enabled {
        start_metrics(&controller, config.prometheus.port)?;
    }

    let printer = spawn_progress_printer(controller.subscribe(), job.id.clone());
    let job_id = match submit(&controller, job, args.resume).await {
        Ok(job_id) => job_id,
        Err(e) => {
            printer.abort();
            error!(error = %e, "Could not start conversion");
            eprintln!("Error: {e}");
            return Ok(ExitCode::from(exit_code_for(&e)));
        }
    };
    info!(job_id = %job_id, state_root = ?state_root, "Conversion started");

    let wait = controller.wait(&job_id);
    tokio::pin!(wait);
    let mut interrupted = false;
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                    continue;
                }
                info!(job_id = %job_id, "Interrupt received, pausing");
                if let Err(e) = controller.pause(&job_id) {
                    warn!(job_id = %job_id, error = %e, "Pause request failed");
                }
            }
        }
    };
    printer.abort();

    match result {
        Ok(RunOutcome::Completed { output, duration_ms }) => {
            println!(
                "Converted {} ({:.1} s) -> {}",
                args.input.display(),
                duration_ms as f64 / 1000.0,
                output.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Paused) | Ok(RunOutcome::Cancelled) => {
            println!("Paused job {job_id}; rerun with --resume to continue.");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Conversion failed");
            eprintln!("Error: {e}");
            Ok(ExitCode::from(exit_code_for(&e)))
        }
    }
}

/// Starts the job fresh, or continues its stored record with `resume`.
///
/// A record that failed, or holds failed units, is restarted with its done
/// units kept.
async fn submit(controller: &JobController, job: Job, resume: bool) -> Result<JobId, EngineError> {
    if !resume {
        return controller.start(job);
    }

    match controller.status(&job.id).await {
        Ok(record) if record.job.status == JobStatus::Failed || !record.failed_indices().is_empty() => {
            info!(job_id = %job.id, "Retrying failed units of previous run");
            controller.restart(&job.id, false).await
        }
        Ok(_) => controller.resume(&job.id).await,
        Err(EngineError::JobNotFound { .. }) => {
            info!(job_id = %job.id, "No previous run found, starting fresh");
            controller.start(job)
        }
        Err(e) => Err(e),
    }
}

/// Absolute destination path; the file itself need not exist yet.
fn absolute_destination(output: &Path) -> Result<PathBuf> {
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = output
        .file_name()
        .with_context(|| format!("Output '{}' has no file name", output.display()))?;
    let parent = std::fs::canonicalize(parent)
        .with_context(|| format!("Failed to resolve output directory '{}'", parent.display()))?;
    Ok(parent.join(name))
}

/// Serves Prometheus metrics fed from the controller's event stream.
fn start_metrics(controller: &JobController, port: u16) -> Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    tokio::spawn(Arc::clone(&metrics).follow(controller.subscribe()));

    let server = MetricsServer::new(metrics, port);
    tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!(error = %e, "Prometheus server failed");
        }
    });
    info!(port, "Prometheus metrics server started");
    Ok(())
}

/// Prints progress lines for one job until it reaches a terminal event.
fn spawn_progress_printer(
    mut events: broadcast::Receiver<ProgressEvent>,
    job_id: JobId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress printer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if event.job_id != job_id {
                continue;
            }

            match &event.kind {
                EventKind::Progress(snapshot) => {
                    let eta = snapshot
                        .eta_secs
                        .map(|s| format!(", eta {}m{:02}s", s / 60, s % 60))
                        .unwrap_or_default();
                    eprintln!(
                        "[{:>3}%] {}/{} units{}",
                        snapshot.percent, snapshot.units_done, snapshot.units_total, eta
                    );
                }
                EventKind::Failed { report } => {
                    eprintln!("Failed ({:?}): {}", report.kind, report.message);
                }
                _ => {}
            }

            if event.kind.is_terminal() {
                break;
            }
        }
    })
}

/// Prints stored progress records.
async fn show_status(args: &StatusArgs, config: &AppConfig) -> Result<ExitCode> {
    let state_root = args
        .state_dir
        .clone()
        .or_else(|| config.global.state_dir.clone())
        .or_else(|| args.output.as_deref().map(default_state_root))
        .context("Pass --state-dir or --output to locate progress records")?;
    let store = FileProgressStore::new(&state_root);

    let records = match &args.job_id {
        Some(id) => vec![store.load(&JobId::from_string(id.clone())).await?],
        None => store.list().await?,
    };

    if records.is_empty() {
        println!("No jobs in {}.", state_root.display());
        return Ok(ExitCode::SUCCESS);
    }

    for record in &records {
        println!("{}", format_status(record));
    }
    Ok(ExitCode::SUCCESS)
}

fn format_status(record: &ProgressRecord) -> String {
    let done = record.count(UnitStatus::Done);
    let total = record.units.len();
    let percent = match record.job.status {
        JobStatus::Completed => 100,
        _ => percent_for(CoordinatorState::Executing, done, total),
    };

    let mut line = format!(
        "{}  {:<9} {}/{} units {:>3}%  {} -> {}",
        record.job.id,
        record.job.status.to_string(),
        done,
        total,
        percent,
        record.job.source.display(),
        record.job.destination.display()
    );
    if let Some(failure) = &record.job.failure {
        line.push_str(&format!(
            "\n    {:?} on units {:?}: {}",
            failure.kind, failure.units, failure.message
        ));
    }
    line
}

/// Validates the configuration and reports any issues.
fn validate_config(config: &AppConfig) -> Result<ExitCode> {
    let capabilities = match SystemCapabilities::detect(&config.transcoder.ffmpeg_path) {
        Ok(capabilities) => Some(capabilities),
        Err(e) => {
            warn!(error = %e, "Skipping toolchain checks");
            None
        }
    };

    let result = validation::validate_config(config, capabilities.as_ref());
    print!("{}", report::format_report(&result));

    if result.is_valid() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}
