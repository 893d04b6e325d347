//! Single-GPU reconstruction worker.
//!
//! Wires the storage areas, the job store, the FIFO queue and the stage
//! runner together behind [`JobManager`], the interface an outer API layer
//! consumes: `submit`, `get_status`, `cancel`, `fetch_output`, plus listing,
//! deletion and lifecycle events.

pub mod config;
pub mod error;
pub mod manager;
pub mod queue;
pub mod retention;
pub mod storage;

pub use config::{ConfigError, WorkerConfig};
pub use error::{ManagerError, SubmitError};
pub use manager::{CancelAck, JobManager};
pub use queue::{JobLease, JobQueue, QueueCancel};
pub use storage::{StorageError, StoragePaths};
