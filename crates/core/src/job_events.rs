//! Lifecycle events published by the job manager.
//!
//! Subscribers (status pollers, tests, a future push channel) receive one
//! event per state change. Events are informational; the job record in the
//! store remains the source of truth.

use std::path::PathBuf;

use serde::Serialize;

use crate::job::{JobError, Stage};
use crate::types::JobId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        job_id: JobId,
    },
    Started {
        job_id: JobId,
    },
    StageChanged {
        job_id: JobId,
        stage: Stage,
    },
    Progress {
        job_id: JobId,
        percent: u8,
    },
    Succeeded {
        job_id: JobId,
        output_ref: PathBuf,
    },
    Failed {
        job_id: JobId,
        error: JobError,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Queued { job_id }
            | Self::Started { job_id }
            | Self::StageChanged { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Succeeded { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => *job_id,
        }
    }

    /// Whether this event ends the job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}
