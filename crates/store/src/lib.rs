//! Job record store.
//!
//! [`JobStore`] is the single source of truth for job state. It keeps every
//! record in memory behind a lock and, when opened on a directory, mirrors
//! each record to a JSON file so jobs survive a worker restart.

pub mod error;
pub mod filter;
pub mod job_store;

pub use error::StoreError;
pub use filter::{JobFilter, JobPage};
pub use job_store::{JobStore, Recovery};
