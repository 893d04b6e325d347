//! Domain types for the reconstruction job orchestrator.
//!
//! Everything in this crate is pure: the job record and its state machine,
//! the failure taxonomy, lifecycle events, and upload validation rules.
//! Persistence lives in `recon-store`, process execution in
//! `recon-pipeline`.

pub mod error;
pub mod input;
pub mod job;
pub mod job_events;
pub mod types;

pub use error::CoreError;
pub use job::{ErrorKind, Job, JobError, JobStatus, Stage};
pub use types::{JobId, Timestamp};
