use std::path::PathBuf;

use recon_core::{CoreError, JobId, JobStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Transition(#[from] CoreError),

    #[error("Worker slot busy: job {running} is already running")]
    SlotBusy { running: JobId },

    #[error("Input {} is already owned by job {owner}", input.display())]
    InputInUse { input: PathBuf, owner: JobId },

    #[error("Job {id} is {status}; only terminal jobs can be deleted")]
    NotTerminal { id: JobId, status: JobStatus },

    #[error("Failed to access job record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt job record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
