//! The four storage areas and their per-job ownership rules.
//!
//! - uploads: submitted image sets; a job owns its input until it is
//!   terminal, after which the input may be removed.
//! - jobs: one exclusive workspace directory per job, plus the job records.
//! - outputs: packaged artifacts, `<job_id>.ply`, kept until deleted.
//! - temp: scratch space, emptied at startup.

use std::path::{Path, PathBuf};

use recon_core::JobId;

use crate::config::WorkerConfig;

/// Sub-directory of the jobs area holding the job record files.
pub const RECORDS_DIR: &str = ".records";

/// Extension of packaged outputs.
pub const OUTPUT_EXTENSION: &str = "ply";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage area {path} is not writable: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace for job {id} already exists at {path}")]
    Collision { id: JobId, path: PathBuf },

    #[error("Input {path} is not inside the uploads area")]
    OutsideUploads { path: PathBuf },

    #[error("Filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct StoragePaths {
    uploads: PathBuf,
    jobs: PathBuf,
    outputs: PathBuf,
    temp: PathBuf,
}

impl StoragePaths {
    pub fn new(
        uploads: impl Into<PathBuf>,
        jobs: impl Into<PathBuf>,
        outputs: impl Into<PathBuf>,
        temp: impl Into<PathBuf>,
    ) -> Self {
        Self {
            uploads: uploads.into(),
            jobs: jobs.into(),
            outputs: outputs.into(),
            temp: temp.into(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            &config.upload_dir,
            &config.jobs_dir,
            &config.output_dir,
            &config.temp_dir,
        )
    }

    pub fn uploads(&self) -> &Path {
        &self.uploads
    }

    pub fn jobs(&self) -> &Path {
        &self.jobs
    }

    pub fn outputs(&self) -> &Path {
        &self.outputs
    }

    pub fn temp(&self) -> &Path {
        &self.temp
    }

    pub fn records_dir(&self) -> PathBuf {
        self.jobs.join(RECORDS_DIR)
    }

    /// Create every area (idempotent), verify each is writable, and empty
    /// the temp area. Any failure here is fatal for the process.
    pub async fn init(&self) -> Result<(), StorageError> {
        for area in [&self.uploads, &self.jobs, &self.outputs, &self.temp] {
            tokio::fs::create_dir_all(area)
                .await
                .map_err(|source| StorageError::Unwritable {
                    path: area.clone(),
                    source,
                })?;

            let probe = area.join(format!(".write-probe-{}", uuid::Uuid::new_v4()));
            tokio::fs::write(&probe, b"")
                .await
                .map_err(|source| StorageError::Unwritable {
                    path: area.clone(),
                    source,
                })?;
            let _ = tokio::fs::remove_file(&probe).await;
        }

        self.purge_temp().await?;

        tracing::info!(
            uploads = %self.uploads.display(),
            jobs = %self.jobs.display(),
            outputs = %self.outputs.display(),
            temp = %self.temp.display(),
            "Storage areas ready",
        );
        Ok(())
    }

    pub fn workspace_path(&self, id: JobId) -> PathBuf {
        self.jobs.join(id.to_string())
    }

    /// Create the exclusive workspace for `id`.
    ///
    /// Fails with [`StorageError::Collision`] if the directory already
    /// exists; an existing workspace is never reused.
    pub async fn reserve_workspace(&self, id: JobId) -> Result<PathBuf, StorageError> {
        let path = self.workspace_path(id);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {
                tracing::debug!(job_id = %id, path = %path.display(), "Workspace reserved");
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::Collision { id, path })
            }
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    /// Remove the workspace for `id`. Best effort: failures are logged,
    /// never returned.
    pub async fn release(&self, id: JobId) {
        let path = self.workspace_path(id);
        remove_best_effort(&path, id, "workspace").await;
    }

    /// Final location of the packaged artifact for `id`.
    pub fn output_path(&self, id: JobId) -> PathBuf {
        self.outputs.join(format!("{id}.{OUTPUT_EXTENSION}"))
    }

    /// Move `artifact` into the outputs area as `<id>.ply`.
    ///
    /// Falls back to copy-through-temp when a rename is not possible, e.g.
    /// when outputs live on another filesystem. Readers never see a
    /// partially written output.
    pub async fn publish_output(&self, id: JobId, artifact: &Path) -> Result<PathBuf, StorageError> {
        let target = self.output_path(id);
        if tokio::fs::rename(artifact, &target).await.is_ok() {
            return Ok(target);
        }

        let staging = self.temp.join(format!("{id}.{OUTPUT_EXTENSION}.partial"));
        tokio::fs::copy(artifact, &staging)
            .await
            .map_err(io_err(artifact))?;
        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(StorageError::Io {
                path: target,
                source: e,
            });
        }
        Ok(target)
    }

    /// Resolve a submitted input reference to a path inside the uploads
    /// area. Relative references are taken relative to the uploads area.
    pub fn resolve_input(&self, input: &Path) -> Result<PathBuf, StorageError> {
        let candidate = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.uploads.join(input)
        };

        let uploads = std::fs::canonicalize(&self.uploads).map_err(io_err(&self.uploads))?;
        let resolved = std::fs::canonicalize(&candidate).map_err(io_err(&candidate))?;

        if resolved == uploads || !resolved.starts_with(&uploads) {
            return Err(StorageError::OutsideUploads { path: candidate });
        }
        Ok(resolved)
    }

    /// Remove a job's upload. Best effort.
    pub async fn remove_input(&self, id: JobId, input: &Path) {
        let canonical = std::fs::canonicalize(&self.uploads).unwrap_or_else(|_| self.uploads.clone());
        let inside = [&self.uploads, &canonical]
            .iter()
            .any(|root| input.starts_with(root) && input != root.as_path());
        if !inside {
            tracing::warn!(job_id = %id, path = %input.display(), "Refusing to remove input outside uploads");
            return;
        }
        remove_best_effort(input, id, "input").await;
    }

    /// Remove a job's packaged output. Best effort.
    pub async fn remove_output(&self, id: JobId, output: &Path) {
        remove_best_effort(output, id, "output").await;
    }

    async fn purge_temp(&self) -> Result<(), StorageError> {
        let mut entries = tokio::fs::read_dir(&self.temp)
            .await
            .map_err(io_err(&self.temp))?;
        let mut purged = 0usize;
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.temp))? {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(t) if t.is_dir() => tokio::fs::remove_dir_all(&path).await,
                _ => tokio::fs::remove_file(&path).await,
            };
            match result {
                Ok(()) => purged += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to purge temp entry"),
            }
        }
        if purged > 0 {
            tracing::info!(purged, "Purged stale temp entries");
        }
        Ok(())
    }
}

async fn remove_best_effort(path: &Path, id: JobId, what: &'static str) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => tracing::debug!(job_id = %id, path = %path.display(), "Removed {what}"),
        Err(e) => tracing::warn!(
            job_id = %id,
            path = %path.display(),
            error = %e,
            "Failed to remove {what}",
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
