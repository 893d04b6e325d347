use std::path::PathBuf;
use std::time::Duration;

use recon_core::input::DEFAULT_MIN_IMAGES;
use recon_pipeline::commands::{
    DEFAULT_EXPORT_NUM_POINTS, DEFAULT_MATCHING_METHOD, DEFAULT_MAX_NUM_ITERATIONS,
    DEFAULT_NERF_METHOD,
};
use recon_pipeline::{StageKind, ToolConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Worker configuration loaded from environment variables.
///
/// All fields have defaults suitable for a single workstation.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub upload_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub sfm_timeout: Duration,
    pub training_timeout: Duration,
    pub packaging_timeout: Duration,
    /// Minimum number of decodable images a submission must contain.
    pub min_input_images: usize,
    pub tools: ToolConfig,
    /// Delete failed workspaces too. Successful and cancelled workspaces
    /// are always released.
    pub cleanup_temp_files: bool,
    /// Age after which terminal jobs are swept. `None` disables the sweep.
    pub output_retention: Option<Duration>,
    pub retention_interval: Duration,
    /// Period of the progress tick while training runs.
    pub progress_tick: Duration,
}

impl WorkerConfig {
    /// Defaults with every storage area under `data_dir`.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            upload_dir: data_dir.join("uploads"),
            jobs_dir: data_dir.join("jobs"),
            output_dir: data_dir.join("outputs"),
            temp_dir: data_dir.join("temp"),
            sfm_timeout: Duration::from_secs(1800),
            training_timeout: Duration::from_secs(7200),
            packaging_timeout: Duration::from_secs(900),
            min_input_images: DEFAULT_MIN_IMAGES,
            tools: ToolConfig::default(),
            cleanup_temp_files: true,
            output_retention: None,
            retention_interval: Duration::from_secs(3600),
            progress_tick: Duration::from_secs(30),
        }
    }

    /// Load configuration from the process environment.
    ///
    /// | Env Var                   | Default                 |
    /// |---------------------------|-------------------------|
    /// | `DATA_DIR`                | `.`                     |
    /// | `UPLOAD_DIR`              | `$DATA_DIR/uploads`     |
    /// | `JOBS_DIR`                | `$DATA_DIR/jobs`        |
    /// | `OUTPUT_DIR`              | `$DATA_DIR/outputs`     |
    /// | `TEMP_DIR`                | `$DATA_DIR/temp`        |
    /// | `SFM_TIMEOUT_SECS`        | `1800`                  |
    /// | `TRAINING_TIMEOUT_SECS`   | `7200`                  |
    /// | `PACKAGING_TIMEOUT_SECS`  | `900`                   |
    /// | `MIN_INPUT_IMAGES`        | `10`                    |
    /// | `MAX_NUM_ITERATIONS`      | `10000`                 |
    /// | `EXPORT_NUM_POINTS`       | `1000000`               |
    /// | `SFM_MATCHING_METHOD`     | `exhaustive`            |
    /// | `NERF_METHOD`             | `instant-ngp`           |
    /// | `SFM_COMMAND`             | `ns-process-data`       |
    /// | `TRAIN_COMMAND`           | `ns-train`              |
    /// | `EXPORT_COMMAND`          | `ns-export`             |
    /// | `CLEANUP_TEMP_FILES`      | `true`                  |
    /// | `OUTPUT_RETENTION_HOURS`  | unset (no sweep)        |
    /// | `RETENTION_INTERVAL_SECS` | `3600`                  |
    /// | `PROGRESS_TICK_SECS`      | `30`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = PathBuf::from(var("DATA_DIR").unwrap_or_else(|| ".".into()));
        let mut config = Self::for_data_dir(data_dir);

        if let Some(dir) = var("UPLOAD_DIR") {
            config.upload_dir = dir.into();
        }
        if let Some(dir) = var("JOBS_DIR") {
            config.jobs_dir = dir.into();
        }
        if let Some(dir) = var("OUTPUT_DIR") {
            config.output_dir = dir.into();
        }
        if let Some(dir) = var("TEMP_DIR") {
            config.temp_dir = dir.into();
        }

        if let Some(v) = var("SFM_TIMEOUT_SECS") {
            config.sfm_timeout = Duration::from_secs(parse_positive("SFM_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = var("TRAINING_TIMEOUT_SECS") {
            config.training_timeout =
                Duration::from_secs(parse_positive("TRAINING_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = var("PACKAGING_TIMEOUT_SECS") {
            config.packaging_timeout =
                Duration::from_secs(parse_positive("PACKAGING_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = var("MIN_INPUT_IMAGES") {
            config.min_input_images = parse_positive("MIN_INPUT_IMAGES", v)? as usize;
        }

        let tools = &mut config.tools;
        tools.max_num_iterations = match var("MAX_NUM_ITERATIONS") {
            Some(v) => u32::try_from(parse_positive("MAX_NUM_ITERATIONS", v.clone())?)
                .map_err(|_| invalid("MAX_NUM_ITERATIONS", v, "a positive 32-bit integer"))?,
            None => DEFAULT_MAX_NUM_ITERATIONS,
        };
        tools.export_num_points = match var("EXPORT_NUM_POINTS") {
            Some(v) => parse_positive("EXPORT_NUM_POINTS", v)?,
            None => DEFAULT_EXPORT_NUM_POINTS,
        };
        tools.matching_method =
            var("SFM_MATCHING_METHOD").unwrap_or_else(|| DEFAULT_MATCHING_METHOD.into());
        tools.nerf_method = var("NERF_METHOD").unwrap_or_else(|| DEFAULT_NERF_METHOD.into());
        if let Some(program) = var("SFM_COMMAND") {
            tools.sfm_program = program;
        }
        if let Some(program) = var("TRAIN_COMMAND") {
            tools.train_program = program;
        }
        if let Some(program) = var("EXPORT_COMMAND") {
            tools.export_program = program;
        }

        if let Some(v) = var("CLEANUP_TEMP_FILES") {
            config.cleanup_temp_files = parse_bool("CLEANUP_TEMP_FILES", v)?;
        }
        if let Some(v) = var("OUTPUT_RETENTION_HOURS") {
            let hours = parse_positive("OUTPUT_RETENTION_HOURS", v)?;
            config.output_retention = Some(Duration::from_secs(hours * 3600));
        }
        if let Some(v) = var("RETENTION_INTERVAL_SECS") {
            config.retention_interval =
                Duration::from_secs(parse_positive("RETENTION_INTERVAL_SECS", v)?);
        }
        if let Some(v) = var("PROGRESS_TICK_SECS") {
            config.progress_tick = Duration::from_secs(parse_positive("PROGRESS_TICK_SECS", v)?);
        }

        Ok(config)
    }

    /// Wall-clock limit for `kind`.
    pub fn stage_timeout(&self, kind: StageKind) -> Duration {
        match kind {
            StageKind::StructureFromMotion => self.sfm_timeout,
            StageKind::NeuralFieldTraining => self.training_timeout,
            StageKind::Packaging => self.packaging_timeout,
        }
    }
}

fn invalid(var: &'static str, value: String, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value,
        expected,
    }
}

fn parse_positive(var: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(var, value, "a positive integer")),
    }
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "a boolean")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
