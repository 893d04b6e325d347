//! Listing filters for job records.

use recon_core::{Job, JobStatus, Timestamp};
use serde::{Deserialize, Serialize};

/// Maximum page size for job listing.
pub const MAX_LIMIT: usize = 100;

/// Default page size for job listing.
pub const DEFAULT_LIMIT: usize = 50;

/// Query parameters for listing jobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// Only terminal jobs that finished strictly before this instant.
    pub finished_before: Option<Timestamp>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<usize>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.status.is_some_and(|s| s != job.status) {
            return false;
        }
        if let Some(cutoff) = self.finished_before {
            return job.finished_at.is_some_and(|at| at < cutoff);
        }
        true
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

/// One page of a listing plus the number of jobs matching the filter.
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: usize,
}
