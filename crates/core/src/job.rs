//! The job record and its state machine.
//!
//! A [`Job`] is only ever mutated through the transition methods below, so
//! the record invariants hold no matter which component drives it:
//!
//! - `output_ref` is set if and only if the status is `Succeeded`.
//! - `error` is set if and only if the status is `Failed`.
//! - `stage` is `None` until the job starts, only moves forward while the
//!   job is running, and is frozen once the job reaches a terminal state.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Maximum number of characters of captured stderr kept on a [`JobError`].
pub const MAX_STDERR_TAIL_CHARS: usize = 4000;

/// Progress reported once a job has finished successfully.
pub const PROGRESS_COMPLETE: u8 = 100;

/// Upper bound for progress while a job is still running.
pub const PROGRESS_RUNNING_CAP: u8 = 99;

// ---------------------------------------------------------------------------
// Status and stage
// ---------------------------------------------------------------------------

/// Lifecycle status of a reconstruction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a running job is in.
///
/// Variants are declared in pipeline order, so `Ord` reflects progress.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    None,
    StructureFromMotion,
    NeuralFieldTraining,
    Packaging,
}

impl Stage {
    /// The stage that follows this one, or `None` after packaging.
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::None => Some(Self::StructureFromMotion),
            Self::StructureFromMotion => Some(Self::NeuralFieldTraining),
            Self::NeuralFieldTraining => Some(Self::Packaging),
            Self::Packaging => None,
        }
    }

    /// Progress percentage reported when a job enters this stage.
    pub fn progress_floor(self) -> u8 {
        match self {
            Self::None => 0,
            Self::StructureFromMotion => 20,
            Self::NeuralFieldTraining => 40,
            Self::Packaging => 90,
        }
    }

    /// Human-readable status message shown while the stage runs.
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "Waiting for the GPU worker",
            Self::StructureFromMotion => "Estimating camera poses (structure from motion)",
            Self::NeuralFieldTraining => "Training the neural field",
            Self::Packaging => "Exporting the 3D model",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::StructureFromMotion => "structure_from_motion",
            Self::NeuralFieldTraining => "neural_field_training",
            Self::Packaging => "packaging",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure detail
// ---------------------------------------------------------------------------

/// Failure taxonomy recorded on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing upload. Rejected at submission.
    InputError,
    /// Workspace reservation or filesystem failure.
    ResourceError,
    /// A stage exceeded its wall-clock timeout.
    StageTimeout,
    /// Non-zero exit, or a stage that exited cleanly without its artifact.
    StageProcessFailure,
    /// User-requested cancellation.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputError => "input_error",
            Self::ResourceError => "resource_error",
            Self::StageTimeout => "stage_timeout",
            Self::StageProcessFailure => "stage_process_failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure detail stored on a `Failed` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Exit code of the failing process, when one ran to completion.
    pub exit_code: Option<i32>,
    /// Last [`MAX_STDERR_TAIL_CHARS`] characters of captured stderr.
    pub stderr_tail: Option<String>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            stderr_tail: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Attach captured stderr, keeping only its tail.
    pub fn with_stderr(mut self, stderr: &str) -> Self {
        let trimmed = stderr.trim_end();
        if trimmed.is_empty() {
            return self;
        }
        let total = trimmed.chars().count();
        let tail: String = trimmed
            .chars()
            .skip(total.saturating_sub(MAX_STDERR_TAIL_CHARS))
            .collect();
        self.stderr_tail = Some(tail);
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// The persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub stage: Stage,
    /// Uploaded image set inside the uploads area.
    pub input_ref: PathBuf,
    /// Per-job scratch directory, assigned when the job starts.
    pub workspace_ref: Option<PathBuf>,
    /// Packaged artifact in the outputs area. Set only on success.
    pub output_ref: Option<PathBuf>,
    /// Failure detail. Set only on failure.
    pub error: Option<JobError>,
    pub progress_percent: u8,
    pub message: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl Job {
    /// A freshly submitted job, waiting in the queue.
    pub fn new(id: JobId, input_ref: PathBuf, now: Timestamp) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            stage: Stage::None,
            input_ref,
            workspace_ref: None,
            output_ref: None,
            error: None,
            progress_percent: 0,
            message: Some(Stage::None.label().to_string()),
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `Queued -> Running(StructureFromMotion)`.
    pub fn start(&mut self, workspace_ref: PathBuf, now: Timestamp) -> Result<(), CoreError> {
        self.require(JobStatus::Queued, JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.workspace_ref = Some(workspace_ref);
        self.started_at = Some(now);
        self.enter_stage(Stage::StructureFromMotion);
        Ok(())
    }

    /// Move a running job to the next pipeline stage.
    ///
    /// Stages can only be entered in pipeline order; skipping or repeating a
    /// stage is rejected.
    pub fn advance(&mut self, stage: Stage) -> Result<(), CoreError> {
        self.require(JobStatus::Running, JobStatus::Running)?;
        if self.stage.next() != Some(stage) {
            return Err(CoreError::StageRegression {
                id: self.id,
                from: self.stage,
                to: stage,
            });
        }
        self.enter_stage(stage);
        Ok(())
    }

    /// Update progress of a running job. Progress never moves backwards
    /// and stays below 100 until the job succeeds.
    pub fn set_progress(&mut self, percent: u8, message: Option<String>) -> Result<(), CoreError> {
        self.require(JobStatus::Running, JobStatus::Running)?;
        let percent = percent.min(PROGRESS_RUNNING_CAP);
        self.progress_percent = self.progress_percent.max(percent);
        if message.is_some() {
            self.message = message;
        }
        Ok(())
    }

    /// `Running(Packaging) -> Succeeded`.
    pub fn succeed(&mut self, output_ref: PathBuf, now: Timestamp) -> Result<(), CoreError> {
        self.require(JobStatus::Running, JobStatus::Succeeded)?;
        if self.stage != Stage::Packaging {
            return Err(CoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: JobStatus::Succeeded,
            });
        }
        self.status = JobStatus::Succeeded;
        self.output_ref = Some(output_ref);
        self.progress_percent = PROGRESS_COMPLETE;
        self.message = Some("3D model generated".to_string());
        self.finished_at = Some(now);
        Ok(())
    }

    /// `Running(*) -> Failed`. The stage stays where the failure happened.
    pub fn fail(&mut self, error: JobError, now: Timestamp) -> Result<(), CoreError> {
        self.require(JobStatus::Running, JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.message = Some(format!("Failed during {}", self.stage));
        self.error = Some(error);
        self.finished_at = Some(now);
        Ok(())
    }

    /// `Queued | Running(*) -> Cancelled`.
    pub fn cancel(&mut self, now: Timestamp) -> Result<(), CoreError> {
        if !matches!(self.status, JobStatus::Queued | JobStatus::Running) {
            return Err(self.invalid(JobStatus::Cancelled));
        }
        self.status = JobStatus::Cancelled;
        self.message = Some("Cancelled by request".to_string());
        self.finished_at = Some(now);
        Ok(())
    }

    /// Verify the record invariants. Used when loading persisted records.
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        let violation = |what: &str| {
            Err(CoreError::Validation(format!(
                "job {} ({}) violates invariant: {what}",
                self.id, self.status
            )))
        };

        if self.output_ref.is_some() != (self.status == JobStatus::Succeeded) {
            return violation("output_ref present iff succeeded");
        }
        if self.error.is_some() != (self.status == JobStatus::Failed) {
            return violation("error present iff failed");
        }
        if self.status == JobStatus::Queued && self.stage != Stage::None {
            return violation("queued job has a stage");
        }
        if self.status == JobStatus::Running && self.stage == Stage::None {
            return violation("running job has no stage");
        }
        if self.is_terminal() != self.finished_at.is_some() {
            return violation("finished_at present iff terminal");
        }
        Ok(())
    }

    // ---- private helpers ----

    fn enter_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.progress_percent = self.progress_percent.max(stage.progress_floor());
        self.message = Some(stage.label().to_string());
    }

    fn require(&self, expected: JobStatus, to: JobStatus) -> Result<(), CoreError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.invalid(to))
        }
    }

    fn invalid(&self, to: JobStatus) -> CoreError {
        CoreError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
