use recon_core::{JobId, JobStatus};
use recon_store::StoreError;

use crate::storage::StorageError;

/// Rejection of a submission. Rejected inputs never create a job.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The input is missing, outside the uploads area, or not a usable
    /// image set.
    #[error("Invalid input: {0}")]
    Input(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The job has no output to fetch.
    #[error("Output for job {id} is not ready (status: {status})")]
    NotReady { id: JobId, status: JobStatus },

    /// The operation requires a terminal job.
    #[error("Job {id} is {status}; cancel it before deleting")]
    NotTerminal { id: JobId, status: JobStatus },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<StoreError> for ManagerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::NotTerminal { id, status } => Self::NotTerminal { id, status },
            other => Self::Store(other),
        }
    }
}
