//! In-memory job table with optional JSON mirroring on disk.
//!
//! Every mutation runs under the write lock: the mutator is applied to a
//! copy, the copy is persisted, and only then is it swapped into the table.
//! Readers always receive owned snapshots, so they can never observe a
//! half-applied update.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use recon_core::{CoreError, ErrorKind, Job, JobError, JobId, JobStatus};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::filter::{JobFilter, JobPage};

/// Extension of persisted job records.
const RECORD_EXTENSION: &str = "json";

/// Extension of records being written; renamed into place once complete.
const PARTIAL_EXTENSION: &str = "json.tmp";

/// Message recorded on jobs that were running when the worker went away.
const INTERRUPTED_MESSAGE: &str = "Interrupted by worker restart";

/// Outcome of [`JobStore::recover`].
#[derive(Debug, Default)]
pub struct Recovery {
    /// Jobs still waiting in the queue, oldest first.
    pub requeue: Vec<Job>,
    /// Jobs that were running and have now been marked failed.
    pub interrupted: Vec<Job>,
}

/// Provides atomic CRUD operations over job records.
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    records_dir: Option<PathBuf>,
}

impl JobStore {
    /// A process-lifetime store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            records_dir: None,
        }
    }

    /// Open a store backed by `records_dir`, loading every record in it.
    ///
    /// Records that cannot be parsed or violate the job invariants are
    /// skipped with a warning rather than aborting startup.
    pub async fn open(records_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let records_dir = records_dir.into();
        tokio::fs::create_dir_all(&records_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: records_dir.clone(),
                source,
            })?;

        let mut jobs = HashMap::new();
        let mut entries = tokio::fs::read_dir(&records_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: records_dir.clone(),
                source,
            })?;

        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
            path: records_dir.clone(),
            source,
        })? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if name.ends_with(PARTIAL_EXTENSION) {
                tracing::warn!(path = %path.display(), "Removing partially written job record");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            match load_record(&path).await {
                Ok(job) => {
                    jobs.insert(job.id, job);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }

        tracing::info!(
            records = jobs.len(),
            dir = %records_dir.display(),
            "Job store opened",
        );

        Ok(Self {
            jobs: RwLock::new(jobs),
            records_dir: Some(records_dir),
        })
    }

    /// Create a new queued job for `input_ref`.
    ///
    /// A job owns its input until it reaches a terminal state, so an input
    /// already held by a live job is refused.
    pub async fn create(&self, input_ref: PathBuf) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        if let Some(owner) = live_owner(&jobs, &input_ref, None) {
            return Err(StoreError::InputInUse {
                input: input_ref,
                owner,
            });
        }
        let job = Job::new(uuid::Uuid::now_v7(), input_ref, Utc::now());
        self.persist(&job).await?;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    /// Snapshot of a single job.
    pub async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Apply `mutator` to a job atomically and return the updated snapshot.
    ///
    /// If the mutator or the write to disk fails, the stored record is left
    /// untouched.
    pub async fn update<F>(&self, id: JobId, mutator: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), CoreError>,
    {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut next = current.clone();
        mutator(&mut next)?;
        self.persist(&next).await?;
        jobs.insert(id, next.clone());
        Ok(next)
    }

    /// Start a queued job, provided no other job currently holds the
    /// running slot.
    pub async fn claim_running(
        &self,
        id: JobId,
        workspace_ref: PathBuf,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        if let Some(other) = jobs
            .values()
            .find(|j| j.status == JobStatus::Running && j.id != id)
        {
            return Err(StoreError::SlotBusy { running: other.id });
        }

        let current = jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut next = current.clone();
        next.start(workspace_ref, Utc::now())?;
        self.persist(&next).await?;
        jobs.insert(id, next.clone());
        Ok(next)
    }

    /// List jobs matching `filter`, newest first.
    pub async fn list(&self, filter: &JobFilter) -> JobPage {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<&Job> = jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len();
        let jobs = matching
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.effective_limit())
            .cloned()
            .collect();

        JobPage { jobs, total }
    }

    /// The live job other than `except` that owns `input_ref`, if any.
    pub async fn input_owner(&self, input_ref: &Path, except: JobId) -> Option<JobId> {
        live_owner(&*self.jobs.read().await, input_ref, Some(except))
    }

    /// Number of jobs currently in `status`.
    pub async fn count(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .count()
    }

    /// Remove a terminal job's record and return it.
    pub async fn delete(&self, id: JobId) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        if !job.is_terminal() {
            return Err(StoreError::NotTerminal {
                id,
                status: job.status,
            });
        }

        if let Some(path) = self.record_path(id) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }

        jobs.remove(&id).ok_or(StoreError::NotFound(id))
    }

    /// Reconcile records left behind by a previous process.
    ///
    /// Running jobs lost their external process with the old worker, so they
    /// are failed with a resource error. Queued jobs are returned in
    /// submission order for re-enqueueing.
    pub async fn recover(&self) -> Result<Recovery, StoreError> {
        let mut jobs = self.jobs.write().await;
        let mut recovery = Recovery::default();

        let running: Vec<JobId> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.id)
            .collect();

        for id in running {
            let Some(current) = jobs.get(&id) else {
                continue;
            };
            let mut next = current.clone();
            next.fail(
                JobError::new(ErrorKind::ResourceError, INTERRUPTED_MESSAGE),
                Utc::now(),
            )?;
            self.persist(&next).await?;
            tracing::warn!(job_id = %id, stage = %next.stage, "Marked interrupted job as failed");
            jobs.insert(id, next.clone());
            recovery.interrupted.push(next);
        }

        recovery.requeue = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .cloned()
            .collect();
        recovery
            .requeue
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(recovery)
    }

    // ---- private helpers ----

    fn record_path(&self, id: JobId) -> Option<PathBuf> {
        self.records_dir
            .as_ref()
            .map(|dir| dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    /// Write `job` to disk via a temp file + rename so a crash mid-write
    /// never leaves a truncated record behind.
    async fn persist(&self, job: &Job) -> Result<(), StoreError> {
        let Some(path) = self.record_path(job.id) else {
            return Ok(());
        };
        let partial = path.with_extension(PARTIAL_EXTENSION);

        let bytes = serde_json::to_vec_pretty(job).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        tokio::fs::write(&partial, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: partial.clone(),
                source,
            })?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }
}

fn live_owner(jobs: &HashMap<JobId, Job>, input_ref: &Path, except: Option<JobId>) -> Option<JobId> {
    jobs.values()
        .find(|j| !j.is_terminal() && Some(j.id) != except && j.input_ref == input_ref)
        .map(|j| j.id)
}

async fn load_record(path: &Path) -> Result<Job, StoreError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let job: Job = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    job.check_invariants()?;
    Ok(job)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use recon_core::Stage;

    use super::*;

    #[tokio::test]
    async fn create_then_get_returns_queued_job() {
        let store = JobStore::in_memory();
        let job = store.create(PathBuf::from("uploads/a")).await.expect("create");

        let fetched = store.get(job.id).await.expect("get");
        assert_eq!(fetched, job);
        assert_eq!(fetched.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = JobStore::in_memory();
        let id = uuid::Uuid::new_v4();
        assert_matches!(store.get(id).await, Err(StoreError::NotFound(missing)) if missing == id);
    }

    #[tokio::test]
    async fn failed_mutator_leaves_record_untouched() {
        let store = JobStore::in_memory();
        let job = store.create(PathBuf::from("uploads/a")).await.expect("create");

        let result = store
            .update(job.id, |j| j.advance(Stage::NeuralFieldTraining))
            .await;
        assert_matches!(result, Err(StoreError::Transition(_)));
        assert_eq!(store.get(job.id).await.expect("get"), job);
    }

    #[tokio::test]
    async fn claim_running_enforces_single_slot() {
        let store = JobStore::in_memory();
        let first = store.create(PathBuf::from("a")).await.expect("create");
        let second = store.create(PathBuf::from("b")).await.expect("create");

        store
            .claim_running(first.id, PathBuf::from("jobs/a"))
            .await
            .expect("claim first");
        let err = store
            .claim_running(second.id, PathBuf::from("jobs/b"))
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::SlotBusy { running } if running == first.id);
        assert_eq!(store.count(JobStatus::Running).await, 1);
    }

    #[tokio::test]
    async fn create_refuses_input_owned_by_live_job() {
        let store = JobStore::in_memory();
        let first = store.create(PathBuf::from("uploads/a")).await.expect("create");

        let err = store.create(PathBuf::from("uploads/a")).await.unwrap_err();
        assert_matches!(err, StoreError::InputInUse { owner, .. } if owner == first.id);
        assert_eq!(
            store.input_owner(Path::new("uploads/a"), uuid::Uuid::nil()).await,
            Some(first.id)
        );
        assert_eq!(store.input_owner(Path::new("uploads/a"), first.id).await, None);

        store
            .update(first.id, |j| j.cancel(Utc::now()))
            .await
            .expect("cancel");
        let second = store.create(PathBuf::from("uploads/a")).await.expect("reuse");
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn delete_requires_terminal_status() {
        let store = JobStore::in_memory();
        let job = store.create(PathBuf::from("a")).await.expect("create");

        assert_matches!(
            store.delete(job.id).await,
            Err(StoreError::NotTerminal {
                status: JobStatus::Queued,
                ..
            })
        );

        store
            .update(job.id, |j| j.cancel(Utc::now()))
            .await
            .expect("cancel");
        store.delete(job.id).await.expect("delete");
        assert_matches!(store.get(job.id).await, Err(StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_pages_newest_first() {
        let store = JobStore::in_memory();
        let mut ids = Vec::new();
        for i in 0..5 {
            let job = store
                .create(PathBuf::from(format!("in/{i}")))
                .await
                .expect("create");
            ids.push(job.id);
        }

        let page = store
            .list(&JobFilter {
                limit: Some(2),
                offset: Some(1),
                ..JobFilter::default()
            })
            .await;
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 2);
        assert!(page.jobs[0].created_at >= page.jobs[1].created_at);
    }
}
