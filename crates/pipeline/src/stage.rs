//! Uniform stage request and result types.

use std::path::PathBuf;
use std::time::Duration;

use recon_core::{ErrorKind, JobError, Stage};
use tokio_util::sync::CancellationToken;

/// The external-process stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Camera pose recovery (`ns-process-data`, COLMAP under the hood).
    StructureFromMotion,
    /// Radiance field fitting (`ns-train`).
    NeuralFieldTraining,
    /// Point cloud export from the trained model (`ns-export`).
    Packaging,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::StructureFromMotion,
        StageKind::NeuralFieldTraining,
        StageKind::Packaging,
    ];

    /// The job stage this kind runs under.
    pub fn stage(self) -> Stage {
        match self {
            Self::StructureFromMotion => Stage::StructureFromMotion,
            Self::NeuralFieldTraining => Stage::NeuralFieldTraining,
            Self::Packaging => Stage::Packaging,
        }
    }

    /// Name of the sub-directory of the workspace this stage writes to.
    pub fn output_dir_name(self) -> &'static str {
        match self {
            Self::StructureFromMotion => "sfm",
            Self::NeuralFieldTraining => "train",
            Self::Packaging => "export",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.stage().fmt(f)
    }
}

/// Inputs for a single stage invocation.
#[derive(Debug, Clone)]
pub struct StageParams {
    /// The stage's input: the image directory for SfM, the SfM output
    /// for training, the trained model's `config.yml` for packaging.
    pub input: PathBuf,
    /// Hard wall-clock limit for the stage process.
    pub timeout: Duration,
    /// Cancelling this token terminates the stage process.
    pub cancel: CancellationToken,
}

/// How a stage invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Ok,
    TimedOut {
        elapsed_ms: u64,
        stderr: String,
    },
    /// Non-zero exit, death by signal, or a missing declared artifact.
    ProcessFailed {
        exit_code: Option<i32>,
        stderr: String,
        stdout: String,
        reason: String,
    },
    IoError(String),
    Cancelled,
}

impl StageOutcome {
    /// Failure detail to record on the job, or `None` for `Ok`/`Cancelled`.
    pub fn to_job_error(&self, kind: StageKind) -> Option<JobError> {
        match self {
            Self::Ok | Self::Cancelled => None,
            Self::TimedOut { elapsed_ms, stderr } => Some(
                JobError::new(
                    ErrorKind::StageTimeout,
                    format!("{kind} exceeded its timeout after {}s", elapsed_ms / 1000),
                )
                .with_stderr(stderr),
            ),
            Self::ProcessFailed {
                exit_code,
                stderr,
                stdout,
                reason,
            } => {
                // Some tools only log to stdout.
                let captured = if stderr.trim().is_empty() { stdout } else { stderr };
                Some(
                    JobError::new(ErrorKind::StageProcessFailure, format!("{kind}: {reason}"))
                        .with_exit_code(*exit_code)
                        .with_stderr(captured),
                )
            }
            Self::IoError(message) => Some(JobError::new(
                ErrorKind::ResourceError,
                format!("{kind}: {message}"),
            )),
        }
    }
}

/// Result of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub outcome: StageOutcome,
    /// Declared artifacts found after a successful run, in a stage-specific
    /// order (see [`crate::artifacts`]).
    pub produced_paths: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn new(outcome: StageOutcome, duration_ms: u64) -> Self {
        Self {
            outcome,
            produced_paths: Vec::new(),
            duration_ms,
        }
    }

    pub fn ok(produced_paths: Vec<PathBuf>, duration_ms: u64) -> Self {
        Self {
            outcome: StageOutcome::Ok,
            produced_paths,
            duration_ms,
        }
    }
}
