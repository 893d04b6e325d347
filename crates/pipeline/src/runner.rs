//! The stage runner seam and its subprocess-backed implementation.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::artifacts;
use crate::commands::ToolConfig;
use crate::stage::{StageKind, StageOutcome, StageParams, StageResult};
use crate::subprocess::{run_command, RunOptions, SubprocessError, DEFAULT_KILL_GRACE};

/// Runs one pipeline stage to completion.
///
/// Implementations never retry and never panic on stage failure: every
/// ending, including timeout and cancellation, is reported as a
/// [`StageOutcome`]. When `run` returns, no process started for the stage
/// is still alive.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, kind: StageKind, workspace: &Path, params: &StageParams) -> StageResult;
}

/// Runs stages as external Nerfstudio processes inside the job workspace.
pub struct CommandStageRunner {
    tools: ToolConfig,
    kill_grace: Duration,
}

impl CommandStageRunner {
    pub fn new(tools: ToolConfig) -> Self {
        Self {
            tools,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }
}

#[async_trait]
impl StageRunner for CommandStageRunner {
    async fn run(&self, kind: StageKind, workspace: &Path, params: &StageParams) -> StageResult {
        let start = Instant::now();
        let elapsed = || start.elapsed().as_millis() as u64;

        let output_dir = workspace.join(kind.output_dir_name());
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            return StageResult::new(
                StageOutcome::IoError(format!(
                    "cannot create stage directory {}: {e}",
                    output_dir.display()
                )),
                elapsed(),
            );
        }

        let mut cmd = self.tools.command(kind, &params.input, &output_dir);
        let mut opts = RunOptions::new(params.timeout, params.cancel.clone()).in_dir(workspace);
        opts.kill_grace = self.kill_grace;

        tracing::info!(
            stage = %kind,
            input = %params.input.display(),
            timeout_secs = params.timeout.as_secs(),
            "Starting stage process",
        );

        let outcome = match run_command(&mut cmd, &opts).await {
            Ok(output) if output.success() => match discover_artifacts(kind, &output_dir).await {
                Ok(paths) => {
                    tracing::info!(stage = %kind, elapsed_ms = output.duration_ms, "Stage completed");
                    return StageResult::ok(paths, elapsed());
                }
                Err(reason) => StageOutcome::ProcessFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                    stdout: output.stdout,
                    reason: format!("exited successfully but {reason}"),
                },
            },
            Ok(output) => {
                let reason = match output.exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                };
                StageOutcome::ProcessFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                    stdout: output.stdout,
                    reason,
                }
            }
            Err(SubprocessError::Timeout { elapsed_ms, stderr }) => {
                StageOutcome::TimedOut { elapsed_ms, stderr }
            }
            Err(SubprocessError::Cancelled { .. }) => StageOutcome::Cancelled,
            Err(e @ (SubprocessError::Spawn { .. } | SubprocessError::Wait(_))) => {
                StageOutcome::IoError(e.to_string())
            }
        };

        tracing::warn!(stage = %kind, outcome = outcome_label(&outcome), "Stage did not complete");
        StageResult::new(outcome, elapsed())
    }
}

/// Walk the stage output on the blocking pool.
async fn discover_artifacts(kind: StageKind, dir: &Path) -> Result<Vec<PathBuf>, String> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || artifacts::discover(kind, &dir))
        .await
        .unwrap_or_else(|e| Err(format!("artifact scan failed: {e}")))
}

fn outcome_label(outcome: &StageOutcome) -> &'static str {
    match outcome {
        StageOutcome::Ok => "ok",
        StageOutcome::TimedOut { .. } => "timed_out",
        StageOutcome::ProcessFailed { .. } => "process_failed",
        StageOutcome::IoError(_) => "io_error",
        StageOutcome::Cancelled => "cancelled",
    }
}
