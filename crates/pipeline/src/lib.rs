//! Stage execution for the reconstruction pipeline.
//!
//! Each pipeline stage is one external program (COLMAP-backed data
//! processing, Nerfstudio training, point cloud export) run inside the job's
//! workspace. [`runner::StageRunner`] is the seam the job manager drives;
//! [`runner::CommandStageRunner`] is the production implementation built on
//! [`subprocess::run_command`].

pub mod artifacts;
pub mod commands;
pub mod runner;
pub mod stage;
pub mod subprocess;

pub use commands::ToolConfig;
pub use runner::{CommandStageRunner, StageRunner};
pub use stage::{StageKind, StageOutcome, StageParams, StageResult};
pub use subprocess::{run_command, CommandOutput, RunOptions, SubprocessError};
