use crate::job::{JobStatus, Stage};
use crate::types::JobId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: JobId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Stage cannot move backwards for job {id}: {from} -> {to}")]
    StageRegression { id: JobId, from: Stage, to: Stage },

    #[error("Internal error: {0}")]
    Internal(String),
}
