//! Subprocess management for stage programs.
//!
//! Provides [`run_command`], which spawns a program in its own process
//! group, drains stdout/stderr, and enforces a wall-clock timeout and a
//! cancellation token. Whenever the call returns, the whole process group
//! has been signalled, so no descendant of the stage program outlives it.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Maximum number of bytes kept from the end of each output stream.
///
/// Stage programs can log for hours; everything is drained but only the
/// tail is retained.
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Time a process group gets to exit after `SIGTERM` before `SIGKILL`.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the output readers once the group is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Execution limits for a single command.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum wall-clock time before the process group is killed.
    pub timeout: Duration,
    /// Cancelling this token kills the process group.
    pub cancel: CancellationToken,
    /// Working directory for the child process (uses current dir if `None`).
    pub working_dir: Option<PathBuf>,
    /// Grace period between `SIGTERM` and `SIGKILL`.
    pub kill_grace: Duration,
}

impl RunOptions {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            cancel,
            working_dir: None,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Tail of stdout (at most [`MAX_CAPTURE_BYTES`]).
    pub stdout: String,
    /// Tail of stderr (at most [`MAX_CAPTURE_BYTES`]).
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64, stderr: String },

    #[error("Process cancelled after {elapsed_ms}ms")]
    Cancelled { elapsed_ms: u64 },

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),
}

enum Finish {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawn `cmd`, capture its output, and enforce the limits in `opts`.
///
/// The caller sets the program and arguments; I/O, working directory and
/// process group are configured here.
pub async fn run_command(
    cmd: &mut Command,
    opts: &RunOptions,
) -> Result<CommandOutput, SubprocessError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // The child leads a fresh process group so the whole tree can be
    // signalled at once.
    #[cfg(unix)]
    cmd.process_group(0);

    if let Some(dir) = &opts.working_dir {
        cmd.current_dir(dir);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| SubprocessError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    tracing::debug!(program = %program, pid = ?pid, "Spawned stage process");

    let stdout_task = tokio::spawn(read_tail(child.stdout.take()));
    let stderr_task = tokio::spawn(read_tail(child.stderr.take()));

    let finish = tokio::select! {
        status = child.wait() => Finish::Exited(status),
        _ = tokio::time::sleep(opts.timeout) => Finish::TimedOut,
        _ = opts.cancel.cancelled() => Finish::Cancelled,
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match finish {
        Finish::Exited(status) => {
            // Reap anything the leader left running in its group.
            kill_group(pid, Signal::Kill);
            let status = status.map_err(SubprocessError::Wait)?;
            let stdout = collect(stdout_task).await;
            let stderr = collect(stderr_task).await;

            Ok(CommandOutput {
                exit_code: status.code(),
                stdout,
                stderr,
                duration_ms: elapsed_ms,
            })
        }
        Finish::TimedOut => {
            tracing::warn!(program = %program, pid = ?pid, elapsed_ms, "Stage process timed out");
            terminate(&mut child, pid, opts.kill_grace).await;
            let stderr = collect(stderr_task).await;
            stdout_task.abort();
            Err(SubprocessError::Timeout { elapsed_ms, stderr })
        }
        Finish::Cancelled => {
            tracing::info!(program = %program, pid = ?pid, elapsed_ms, "Stage process cancelled");
            terminate(&mut child, pid, opts.kill_grace).await;
            stdout_task.abort();
            stderr_task.abort();
            Err(SubprocessError::Cancelled { elapsed_ms })
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// `SIGTERM` the group, wait up to `grace`, then `SIGKILL` and reap.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    kill_group(pid, Signal::Term);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(pid = ?pid, "Process group ignored SIGTERM, sending SIGKILL");
    }
    kill_group(pid, Signal::Kill);
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Safety: killpg only sends a signal; the group id is the child's pid
    // because it was spawned with `process_group(0)`. ESRCH (group already
    // gone) is expected and ignored.
    unsafe {
        libc::killpg(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>, _signal: Signal) {}

/// Drain a stream to EOF, keeping only the last [`MAX_CAPTURE_BYTES`].
async fn read_tail<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut tail = Vec::new();
    let Some(mut reader) = handle else {
        return tail;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > 2 * MAX_CAPTURE_BYTES {
                    let excess = tail.len() - MAX_CAPTURE_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    if tail.len() > MAX_CAPTURE_BYTES {
        let excess = tail.len() - MAX_CAPTURE_BYTES;
        tail.drain(..excess);
    }
    tail
}

async fn collect(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
