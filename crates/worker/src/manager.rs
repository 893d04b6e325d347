//! The job manager.
//!
//! Admits submissions, answers status queries, and drives each leased job
//! through structure from motion, training and packaging on the single
//! worker slot. Every transition goes through the job store; stage failures
//! are recorded on the job and never escape the worker loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use recon_core::input::scan_image_set;
use recon_core::job_events::JobEvent;
use recon_core::{CoreError, ErrorKind, Job, JobError, JobId, JobStatus};
use recon_pipeline::{StageKind, StageOutcome, StageParams, StageResult, StageRunner};
use recon_store::{JobFilter, JobPage, JobStore, StoreError};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{ManagerError, SubmitError};
use crate::queue::{JobLease, JobQueue, QueueCancel};
use crate::storage::StoragePaths;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Training progress never ticks past this; packaging starts at 90.
const TRAINING_PROGRESS_CAP: u8 = 85;
const TRAINING_PROGRESS_STEP: u8 = 5;

const SHUTDOWN_MESSAGE: &str = "Interrupted by worker shutdown";

/// Acknowledgement returned by [`JobManager::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// The job was waiting and is now `Cancelled`.
    Cancelled,
    /// The job is running; it will become `Cancelled` once its stage
    /// process has been terminated.
    Requested,
    /// The job had already reached this terminal status.
    AlreadyFinished(JobStatus),
}

/// How a leased job ended.
enum Conclusion {
    Succeeded(PathBuf),
    Failed(JobError),
    Cancelled,
    /// The worker is shutting down underneath the job.
    Interrupted,
}

pub struct JobManager {
    config: WorkerConfig,
    storage: StoragePaths,
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    runner: Arc<dyn StageRunner>,
    event_tx: broadcast::Sender<JobEvent>,
    /// Serializes taking and giving up input ownership, so an upload is
    /// never removed while a submission for it is being admitted.
    inputs: Mutex<()>,
}

impl JobManager {
    pub fn new(
        config: WorkerConfig,
        storage: StoragePaths,
        store: Arc<JobStore>,
        runner: Arc<dyn StageRunner>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            storage,
            store,
            queue: JobQueue::new(),
            runner,
            event_tx,
            inputs: Mutex::new(()),
        })
    }

    /// Prepare storage, load persisted jobs and recover from a previous
    /// run. The worker loop is not started.
    pub async fn open(
        config: WorkerConfig,
        runner: Arc<dyn StageRunner>,
    ) -> Result<Arc<Self>, ManagerError> {
        let storage = StoragePaths::from_config(&config);
        storage.init().await?;
        let store = Arc::new(JobStore::open(storage.records_dir()).await?);

        let manager = Self::new(config, storage, store, runner);
        manager.recover().await?;
        Ok(manager)
    }

    pub fn storage(&self) -> &StoragePaths {
        &self.storage
    }

    /// Receive a [`JobEvent`] for every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Caller-facing operations
    // -----------------------------------------------------------------------

    /// Validate `input_ref` and queue a new job for it.
    ///
    /// Invalid inputs are rejected here and never create a job, as is an
    /// input still owned by another queued or running job.
    pub async fn submit(&self, input_ref: impl Into<PathBuf>) -> Result<JobId, SubmitError> {
        let input_ref = input_ref.into();
        let _inputs = self.inputs.lock().await;
        let storage = self.storage.clone();
        let min_images = self.config.min_input_images;

        let image_set = tokio::task::spawn_blocking(move || {
            let dir = storage
                .resolve_input(&input_ref)
                .map_err(|e| SubmitError::Input(e.to_string()))?;
            scan_image_set(&dir, min_images).map_err(|e| match e {
                CoreError::Validation(msg) => SubmitError::Input(msg),
                other => SubmitError::Input(other.to_string()),
            })
        })
        .await
        .map_err(|e| SubmitError::Internal(format!("Input validation task failed: {e}")))??;

        let job = self.store.create(image_set.dir).await.map_err(|e| match e {
            e @ StoreError::InputInUse { .. } => SubmitError::Input(e.to_string()),
            other => SubmitError::Store(other),
        })?;
        tracing::info!(
            job_id = %job.id,
            images = image_set.images.len(),
            input = %job.input_ref.display(),
            "Job submitted",
        );

        self.emit(JobEvent::Queued { job_id: job.id });
        self.queue.enqueue(job.id);
        tracing::debug!(job_id = %job.id, queue_depth = self.queue.pending_len(), "Job queued");
        Ok(job.id)
    }

    /// Snapshot of a job. Failures are reported as data on the record.
    pub async fn get_status(&self, id: JobId) -> Result<Job, ManagerError> {
        Ok(self.store.get(id).await?)
    }

    /// Cancel a job.
    ///
    /// A queued job moves straight to `Cancelled` without ever running. A
    /// running job has its stage process terminated; the worker records the
    /// cancellation once the process is gone.
    pub async fn cancel(&self, id: JobId) -> Result<CancelAck, ManagerError> {
        let job = self.store.get(id).await?;
        if job.is_terminal() {
            return Ok(CancelAck::AlreadyFinished(job.status));
        }

        match self.queue.cancel(id) {
            QueueCancel::Signalled => {
                tracing::info!(job_id = %id, stage = %job.stage, "Cancellation requested");
                Ok(CancelAck::Requested)
            }
            QueueCancel::Unknown if job.status == JobStatus::Running => {
                tracing::warn!(job_id = %id, "Running job does not hold the worker slot");
                Ok(CancelAck::Requested)
            }
            QueueCancel::Removed | QueueCancel::Unknown => {
                match self.store.update(id, |j| j.cancel(Utc::now())).await {
                    Ok(_) => {
                        tracing::info!(job_id = %id, "Queued job cancelled");
                        self.emit(JobEvent::Cancelled { job_id: id });
                        Ok(CancelAck::Cancelled)
                    }
                    Err(StoreError::Transition(_)) => {
                        let job = self.store.get(id).await?;
                        if job.is_terminal() {
                            Ok(CancelAck::AlreadyFinished(job.status))
                        } else {
                            Ok(CancelAck::Requested)
                        }
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Path of a succeeded job's packaged artifact.
    pub async fn fetch_output(&self, id: JobId) -> Result<PathBuf, ManagerError> {
        let job = self.store.get(id).await?;
        match (job.status, job.output_ref) {
            (JobStatus::Succeeded, Some(output)) => Ok(output),
            (status, _) => Err(ManagerError::NotReady { id, status }),
        }
    }

    pub async fn list(&self, filter: &JobFilter) -> JobPage {
        self.store.list(filter).await
    }

    /// Delete a terminal job along with its output, upload and any kept
    /// workspace.
    pub async fn delete(&self, id: JobId) -> Result<Job, ManagerError> {
        let job = self.store.delete(id).await?;

        if let Some(output) = &job.output_ref {
            self.storage.remove_output(id, output).await;
        }
        self.release_input(id, &job.input_ref).await;
        self.storage.release(id).await;

        tracing::info!(job_id = %id, status = %job.status, "Job deleted");
        Ok(job)
    }

    /// Reconcile persisted jobs after a restart. Returns the number of jobs
    /// put back on the queue.
    pub async fn recover(&self) -> Result<usize, ManagerError> {
        let recovery = self.store.recover().await?;

        for job in &recovery.interrupted {
            self.storage.release(job.id).await;
            if let Some(error) = &job.error {
                self.emit(JobEvent::Failed {
                    job_id: job.id,
                    error: error.clone(),
                });
            }
        }
        for job in &recovery.requeue {
            self.queue.enqueue(job.id);
        }

        if !recovery.interrupted.is_empty() || !recovery.requeue.is_empty() {
            tracing::info!(
                requeued = recovery.requeue.len(),
                interrupted = recovery.interrupted.len(),
                "Recovered jobs from previous run",
            );
        }
        Ok(recovery.requeue.len())
    }

    // -----------------------------------------------------------------------
    // Worker loop
    // -----------------------------------------------------------------------

    /// Spawn the worker loop on the runtime.
    pub fn spawn_worker(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_worker(shutdown).await })
    }

    /// Process jobs one at a time until `shutdown` is cancelled.
    pub async fn run_worker(&self, shutdown: CancellationToken) {
        tracing::info!("Worker started");
        while let Some(lease) = self.queue.dequeue_blocking(&shutdown).await {
            self.process(lease, &shutdown).await;
        }
        tracing::info!("Worker stopped");
    }

    async fn process(&self, lease: JobLease, shutdown: &CancellationToken) {
        let id = lease.id();
        if let Err(e) = self.drive(&lease, shutdown).await {
            tracing::error!(job_id = %id, error = %e, "Job processing aborted");
            self.abandon(id, &e).await;
        }
        // The slot is freed only after the terminal state is stored.
        drop(lease);
    }

    async fn drive(&self, lease: &JobLease, shutdown: &CancellationToken) -> Result<(), ManagerError> {
        let id = lease.id();
        let job = self.store.get(id).await?;
        if job.status != JobStatus::Queued {
            tracing::debug!(job_id = %id, status = %job.status, "Skipping job that is no longer queued");
            return Ok(());
        }

        if lease.is_cancelled() {
            if shutdown.is_cancelled() {
                // Left queued; recovery picks it up on the next start.
                return Ok(());
            }
            self.store.update(id, |j| j.cancel(Utc::now())).await?;
            tracing::info!(job_id = %id, "Job cancelled before starting");
            self.emit(JobEvent::Cancelled { job_id: id });
            return Ok(());
        }

        let workspace = self.storage.workspace_path(id);
        let job = self.store.claim_running(id, workspace.clone()).await?;
        tracing::info!(
            job_id = %id,
            waited_ms = (job.started_at.unwrap_or(job.created_at) - job.created_at).num_milliseconds(),
            "Job started",
        );
        self.emit(JobEvent::Started { job_id: id });
        self.emit_stage(&job);

        let (conclusion, owns_workspace) = match self.storage.reserve_workspace(id).await {
            Ok(_) => (self.run_stages(lease, shutdown, &job).await?, true),
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Workspace reservation failed");
                (
                    Conclusion::Failed(JobError::new(ErrorKind::ResourceError, e.to_string())),
                    false,
                )
            }
        };

        self.conclude(id, conclusion, owns_workspace).await
    }

    async fn run_stages(
        &self,
        lease: &JobLease,
        shutdown: &CancellationToken,
        job: &Job,
    ) -> Result<Conclusion, ManagerError> {
        let id = job.id;
        let Some(workspace) = job.workspace_ref.clone() else {
            return Ok(Conclusion::Failed(JobError::new(
                ErrorKind::ResourceError,
                "Job has no workspace",
            )));
        };
        let mut input = job.input_ref.clone();

        for kind in StageKind::ALL {
            // Checked before advancing so a cancelled job stays on the last
            // stage that actually ran.
            if lease.is_cancelled() {
                return Ok(self.cancellation(shutdown));
            }
            if kind.stage() != job.stage {
                let job = self.store.update(id, |j| j.advance(kind.stage())).await?;
                self.emit_stage(&job);
            }

            tracing::info!(job_id = %id, stage = %kind, "Stage started");
            let params = StageParams {
                input: input.clone(),
                timeout: self.config.stage_timeout(kind),
                cancel: lease.cancel_token().clone(),
            };
            let result = if kind == StageKind::NeuralFieldTraining {
                self.run_with_progress(id, kind, &workspace, &params).await
            } else {
                self.runner.run(kind, &workspace, &params).await
            };

            match &result.outcome {
                StageOutcome::Ok => {}
                StageOutcome::Cancelled => return Ok(self.cancellation(shutdown)),
                failed => {
                    let error = failed.to_job_error(kind).unwrap_or_else(|| {
                        JobError::new(ErrorKind::StageProcessFailure, format!("{kind} failed"))
                    });
                    return Ok(Conclusion::Failed(error));
                }
            }

            let Some(artifact) = primary_artifact(&result) else {
                return Ok(Conclusion::Failed(JobError::new(
                    ErrorKind::StageProcessFailure,
                    format!("{kind} reported success without producing its artifact"),
                )));
            };
            tracing::info!(
                job_id = %id,
                stage = %kind,
                duration_ms = result.duration_ms,
                artifact = %artifact.display(),
                "Stage finished",
            );

            input = match kind {
                // Training reads the directory holding transforms.json.
                StageKind::StructureFromMotion => artifact
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or(artifact),
                StageKind::NeuralFieldTraining | StageKind::Packaging => artifact,
            };
        }

        if lease.is_cancelled() {
            return Ok(self.cancellation(shutdown));
        }

        match self.storage.publish_output(id, &input).await {
            Ok(output) => Ok(Conclusion::Succeeded(output)),
            Err(e) => Ok(Conclusion::Failed(JobError::new(
                ErrorKind::ResourceError,
                format!("Failed to publish output: {e}"),
            ))),
        }
    }

    /// Run a stage while ticking progress forward until it returns.
    async fn run_with_progress(
        &self,
        id: JobId,
        kind: StageKind,
        workspace: &Path,
        params: &StageParams,
    ) -> StageResult {
        let run = self.runner.run(kind, workspace, params);
        tokio::pin!(run);

        let period = self.config.progress_tick;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut reported = kind.stage().progress_floor();

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = ticker.tick(), if reported < TRAINING_PROGRESS_CAP => {
                    let next = reported.saturating_add(TRAINING_PROGRESS_STEP).min(TRAINING_PROGRESS_CAP);
                    match self.store.update(id, |j| j.set_progress(next, None)).await {
                        Ok(job) => {
                            reported = job.progress_percent;
                            self.emit(JobEvent::Progress { job_id: id, percent: reported });
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %id, error = %e, "Failed to record progress");
                        }
                    }
                }
            }
        }
    }

    async fn conclude(
        &self,
        id: JobId,
        conclusion: Conclusion,
        owns_workspace: bool,
    ) -> Result<(), ManagerError> {
        let now = Utc::now();
        match conclusion {
            Conclusion::Succeeded(output) => {
                let job = match self.store.update(id, |j| j.succeed(output.clone(), now)).await {
                    Ok(job) => job,
                    Err(e) => {
                        self.storage.remove_output(id, &output).await;
                        return Err(e.into());
                    }
                };
                if owns_workspace {
                    self.storage.release(id).await;
                }
                if self.config.cleanup_temp_files {
                    self.release_input(id, &job.input_ref).await;
                }
                tracing::info!(
                    job_id = %id,
                    output = %output.display(),
                    elapsed_ms = elapsed_ms(&job),
                    "Job succeeded",
                );
                self.emit(JobEvent::Succeeded {
                    job_id: id,
                    output_ref: output,
                });
            }
            Conclusion::Failed(error) => {
                let job = self.store.update(id, |j| j.fail(error.clone(), now)).await?;
                self.release_failed(id, owns_workspace).await;
                tracing::warn!(
                    job_id = %id,
                    stage = %job.stage,
                    kind = %error.kind,
                    error = %error,
                    "Job failed",
                );
                self.emit(JobEvent::Failed { job_id: id, error });
            }
            Conclusion::Cancelled => {
                let job = self.store.update(id, |j| j.cancel(now)).await?;
                if owns_workspace {
                    self.storage.release(id).await;
                }
                tracing::info!(job_id = %id, stage = %job.stage, "Job cancelled");
                self.emit(JobEvent::Cancelled { job_id: id });
            }
            Conclusion::Interrupted => {
                let error = JobError::new(ErrorKind::ResourceError, SHUTDOWN_MESSAGE);
                let job = self.store.update(id, |j| j.fail(error.clone(), now)).await?;
                self.release_failed(id, owns_workspace).await;
                tracing::warn!(job_id = %id, stage = %job.stage, "Job interrupted by shutdown");
                self.emit(JobEvent::Failed { job_id: id, error });
            }
        }
        Ok(())
    }

    /// Last-resort bookkeeping when driving a job hit an internal error:
    /// a job must not stay `Running` once it has lost the worker slot.
    async fn abandon(&self, id: JobId, cause: &ManagerError) {
        let error = JobError::new(ErrorKind::ResourceError, cause.to_string());
        let result = self
            .store
            .update(id, |j| match j.status {
                JobStatus::Running => j.fail(error.clone(), Utc::now()),
                _ => Ok(()),
            })
            .await;
        match result {
            Ok(job) if job.status == JobStatus::Failed && job.error.as_ref() == Some(&error) => {
                self.release_failed(id, true).await;
                self.emit(JobEvent::Failed { job_id: id, error });
            }
            Ok(_) => {}
            Err(e) => tracing::error!(job_id = %id, error = %e, "Failed to record job failure"),
        }
    }

    /// Remove a finished job's upload unless a live job has since taken
    /// ownership of it.
    async fn release_input(&self, id: JobId, input: &Path) {
        let _inputs = self.inputs.lock().await;
        if let Some(owner) = self.store.input_owner(input, id).await {
            tracing::debug!(job_id = %id, owner = %owner, "Input owned by another job; keeping it");
            return;
        }
        self.storage.remove_input(id, input).await;
    }

    async fn release_failed(&self, id: JobId, owns_workspace: bool) {
        if !owns_workspace {
            return;
        }
        if self.config.cleanup_temp_files {
            self.storage.release(id).await;
        } else {
            tracing::info!(
                job_id = %id,
                workspace = %self.storage.workspace_path(id).display(),
                "Keeping failed workspace for inspection",
            );
        }
    }

    fn cancellation(&self, shutdown: &CancellationToken) -> Conclusion {
        if shutdown.is_cancelled() {
            Conclusion::Interrupted
        } else {
            Conclusion::Cancelled
        }
    }

    fn emit_stage(&self, job: &Job) {
        tracing::debug!(job_id = %job.id, stage = %job.stage, progress = job.progress_percent, "Stage entered");
        self.emit(JobEvent::StageChanged {
            job_id: job.id,
            stage: job.stage,
        });
        self.emit(JobEvent::Progress {
            job_id: job.id,
            percent: job.progress_percent,
        });
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

/// The artifact the next step consumes, if every declared path exists.
fn primary_artifact(result: &StageResult) -> Option<PathBuf> {
    if result.produced_paths.iter().all(|p| p.exists()) {
        result.produced_paths.first().cloned()
    } else {
        None
    }
}

fn elapsed_ms(job: &Job) -> i64 {
    match (job.started_at, job.finished_at) {
        (Some(start), Some(end)) => (end - start).num_milliseconds(),
        _ => 0,
    }
}
