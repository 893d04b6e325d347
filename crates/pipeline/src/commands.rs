//! Command lines for the Nerfstudio toolchain.

use std::path::Path;

use tokio::process::Command;

use crate::stage::StageKind;

pub const DEFAULT_SFM_PROGRAM: &str = "ns-process-data";
pub const DEFAULT_TRAIN_PROGRAM: &str = "ns-train";
pub const DEFAULT_EXPORT_PROGRAM: &str = "ns-export";
pub const DEFAULT_MATCHING_METHOD: &str = "exhaustive";
pub const DEFAULT_NERF_METHOD: &str = "instant-ngp";
pub const DEFAULT_MAX_NUM_ITERATIONS: u32 = 10_000;
pub const DEFAULT_EXPORT_NUM_POINTS: u64 = 1_000_000;

/// Fixed names so the training output path is predictable.
const EXPERIMENT_NAME: &str = "job";
const RUN_TIMESTAMP: &str = "run";

/// Programs and tuning knobs for the three stage tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub sfm_program: String,
    pub train_program: String,
    pub export_program: String,
    /// COLMAP feature matching strategy (`exhaustive`, `sequential`, ...).
    pub matching_method: String,
    /// Nerfstudio method name passed to `ns-train`.
    pub nerf_method: String,
    pub max_num_iterations: u32,
    pub export_num_points: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            sfm_program: DEFAULT_SFM_PROGRAM.to_string(),
            train_program: DEFAULT_TRAIN_PROGRAM.to_string(),
            export_program: DEFAULT_EXPORT_PROGRAM.to_string(),
            matching_method: DEFAULT_MATCHING_METHOD.to_string(),
            nerf_method: DEFAULT_NERF_METHOD.to_string(),
            max_num_iterations: DEFAULT_MAX_NUM_ITERATIONS,
            export_num_points: DEFAULT_EXPORT_NUM_POINTS,
        }
    }
}

impl ToolConfig {
    /// Build the command for `kind`, reading `input` and writing to
    /// `output_dir`.
    pub fn command(&self, kind: StageKind, input: &Path, output_dir: &Path) -> Command {
        match kind {
            StageKind::StructureFromMotion => {
                let mut cmd = Command::new(&self.sfm_program);
                cmd.arg("images")
                    .arg("--data")
                    .arg(input)
                    .arg("--output-dir")
                    .arg(output_dir)
                    .args(["--matching-method", &self.matching_method]);
                cmd
            }
            StageKind::NeuralFieldTraining => {
                let mut cmd = Command::new(&self.train_program);
                cmd.arg(&self.nerf_method)
                    .arg("--data")
                    .arg(input)
                    .arg("--output-dir")
                    .arg(output_dir)
                    .args(["--max-num-iterations", &self.max_num_iterations.to_string()])
                    .args(["--pipeline.model.predict-normals", "True"])
                    .args(["--vis", "tensorboard"])
                    .args(["--viewer.quit-on-train-completion", "True"])
                    .args(["--experiment-name", EXPERIMENT_NAME])
                    .args(["--timestamp", RUN_TIMESTAMP]);
                cmd
            }
            StageKind::Packaging => {
                let mut cmd = Command::new(&self.export_program);
                cmd.arg("pointcloud")
                    .arg("--load-config")
                    .arg(input)
                    .arg("--output-dir")
                    .arg(output_dir)
                    .args(["--num-points", &self.export_num_points.to_string()])
                    .args(["--remove-outliers", "True"])
                    .args(["--normal-method", "model_output"]);
                cmd
            }
        }
    }
}
