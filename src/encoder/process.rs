//! Cancellable subprocess execution with process-group termination.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TranscodeError;

/// Number of trailing stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// How a supervised process ended.
#[derive(Debug)]
pub enum ProcessExit {
    /// The process exited on its own.
    Exited {
        status: ExitStatus,
        stderr_tail: String,
    },
    /// The cancellation token fired and the process was terminated.
    Cancelled,
    /// The timeout elapsed and the process was terminated.
    TimedOut,
}

/// Runs `cmd` to completion unless `cancel` fires or `timeout` elapses.
///
/// The child runs in its own process group so termination reaches any
/// helpers it spawned. On cancellation the group receives SIGTERM and, after
/// `kill_grace`, SIGKILL.
pub async fn run_cancellable(
    mut cmd: Command,
    program: &str,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    kill_grace: Duration,
) -> Result<ProcessExit, TranscodeError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TranscodeError::ToolNotFound {
            program: program.to_string(),
        },
        _ => TranscodeError::SpawnFailed {
            program: program.to_string(),
            source: e,
        },
    })?;

    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(collect_tail(stderr, program.to_string())));

    let deadline = async move {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };

    let mut exit = tokio::select! {
        status = child.wait() => {
            let status = status?;
            ProcessExit::Exited { status, stderr_tail: String::new() }
        }
        _ = cancel.cancelled() => {
            debug!(program, pid = ?child.id(), "Cancelling subprocess");
            terminate(&mut child, kill_grace).await;
            ProcessExit::Cancelled
        }
        _ = deadline => {
            warn!(program, pid = ?child.id(), "Subprocess timed out");
            terminate(&mut child, kill_grace).await;
            ProcessExit::TimedOut
        }
    };

    let tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    if let ProcessExit::Exited { stderr_tail, .. } = &mut exit {
        *stderr_tail = tail;
    }

    Ok(exit)
}

/// Reads stderr to the end, keeping the last few lines.
async fn collect_tail(stderr: ChildStderr, program: String) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    while let Ok(Some(line)) = lines.next_line().await {
        debug!(program = %program, line = %line, "subprocess stderr");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    Vec::from(tail).join("\n")
}

#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM to process group failed");
    }

    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    warn!(pid, "Process group ignored SIGTERM, sending SIGKILL");
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        debug!(pid, error = %e, "SIGKILL to process group failed");
    }
    if let Err(e) = child.kill().await {
        debug!(pid, error = %e, "Failed to reap killed subprocess");
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _grace: Duration) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill subprocess");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_exit_status_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo first >&2; echo second >&2; exit 3"]);

        let exit = run_cancellable(cmd, "sh", &CancellationToken::new(), None, Duration::from_secs(1))
            .await
            .unwrap();

        match exit {
            ProcessExit::Exited { status, stderr_tail } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr_tail, "first\nsecond");
            }
            other => panic!("unexpected exit: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_terminates_the_process() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let exit = run_cancellable(cmd, "sh", &cancel, None, Duration::from_secs(2))
            .await
            .unwrap();

        assert!(matches!(exit, ProcessExit::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_terminates_the_process() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);

        let exit = run_cancellable(
            cmd,
            "sh",
            &CancellationToken::new(),
            Some(Duration::from_millis(100)),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert!(matches!(exit, ProcessExit::TimedOut));
    }

    #[tokio::test]
    async fn missing_program_is_tool_not_found() {
        let cmd = Command::new("/definitely/not/a/real/binary");
        let err = run_cancellable(
            cmd,
            "/definitely/not/a/real/binary",
            &CancellationToken::new(),
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, TranscodeError::ToolNotFound { .. }));
    }
}
