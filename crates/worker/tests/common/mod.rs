//! Shared fixtures for the worker integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use recon_core::job_events::JobEvent;
use recon_core::JobId;
use recon_pipeline::{StageKind, StageOutcome, StageParams, StageResult, StageRunner};
use recon_worker::WorkerConfig;
use tokio::sync::{broadcast, Notify};

/// Generous upper bound for any single scenario step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Write `count` small PNG images into `dir`.
pub fn write_images(dir: &Path, count: usize) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        image::RgbImage::new(16, 12)
            .save(dir.join(format!("frame_{i:04}.png")))
            .unwrap();
    }
}

/// Configuration rooted at `root` with short timeouts and a fast progress
/// tick.
pub fn test_config(root: &Path) -> WorkerConfig {
    let mut config = WorkerConfig::for_data_dir(root);
    config.sfm_timeout = Duration::from_secs(5);
    config.training_timeout = Duration::from_secs(5);
    config.packaging_timeout = Duration::from_secs(5);
    config.progress_tick = Duration::from_millis(50);
    config
}

/// Create an upload called `name` holding `count` images; returns the
/// reference to submit.
pub fn upload(config: &WorkerConfig, name: &str, count: usize) -> PathBuf {
    write_images(&config.upload_dir.join(name), count);
    PathBuf::from(name)
}

/// Wait for the terminal event of `id`.
pub async fn wait_terminal(rx: &mut broadcast::Receiver<JobEvent>, id: JobId) -> JobEvent {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if event.job_id() == id && event.is_terminal() => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("job did not finish in time")
}

/// Collect every event of `id` up to and including its terminal event.
pub async fn collect_events(rx: &mut broadcast::Receiver<JobEvent>, id: JobId) -> Vec<JobEvent> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        let mut events = Vec::new();
        loop {
            match rx.recv().await {
                Ok(event) if event.job_id() == id => {
                    let done = event.is_terminal();
                    events.push(event);
                    if done {
                        return events;
                    }
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream broken: {e}"),
            }
        }
    })
    .await
    .expect("job did not finish in time")
}

/// What the fake runner does for a stage.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Write the stage's artifacts and succeed.
    Succeed,
    /// Wait, then succeed.
    SucceedAfter(Duration),
    /// Wait, then succeed even if cancellation was requested meanwhile.
    SucceedIgnoringCancel(Duration),
    /// Exit "cleanly" without writing anything.
    SucceedWithoutArtifact,
    /// Fail with this exit code and stderr.
    Fail(i32, &'static str),
    /// Run until cancelled or timed out.
    Hang,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub job_workspace: PathBuf,
    pub kind: StageKind,
    pub input: PathBuf,
    pub timeout: Duration,
    pub outcome: StageOutcome,
}

/// Scripted [`StageRunner`] that records every invocation.
#[derive(Default)]
pub struct FakeRunner {
    behaviors: Mutex<HashMap<StageKind, Behavior>>,
    calls: Mutex<Vec<Call>>,
    entered: Mutex<Vec<(PathBuf, StageKind)>>,
    entered_notify: Notify,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with(self: Arc<Self>, kind: StageKind, behavior: Behavior) -> Arc<Self> {
        self.behaviors.lock().unwrap().insert(kind, behavior);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of stages that ever ran at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Wait until a stage of `kind` has started for `workspace`.
    pub async fn wait_entered(&self, workspace: &Path, kind: StageKind) {
        tokio::time::timeout(STEP_TIMEOUT, async {
            loop {
                let notified = self.entered_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self
                    .entered
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|(ws, k)| ws == workspace && *k == kind)
                {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("stage never started");
    }

    fn behavior(&self, kind: StageKind) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or(Behavior::Succeed)
    }
}

#[async_trait]
impl StageRunner for FakeRunner {
    async fn run(&self, kind: StageKind, workspace: &Path, params: &StageParams) -> StageResult {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);
        self.entered
            .lock()
            .unwrap()
            .push((workspace.to_path_buf(), kind));
        self.entered_notify.notify_waiters();

        let result = match self.behavior(kind) {
            Behavior::Succeed => StageResult::ok(write_artifacts(kind, workspace), 1),
            Behavior::SucceedAfter(delay) => {
                tokio::select! {
                    _ = params.cancel.cancelled() => StageResult::new(StageOutcome::Cancelled, 1),
                    _ = tokio::time::sleep(delay) => StageResult::ok(write_artifacts(kind, workspace), 1),
                }
            }
            Behavior::SucceedIgnoringCancel(delay) => {
                tokio::time::sleep(delay).await;
                StageResult::ok(write_artifacts(kind, workspace), 1)
            }
            Behavior::SucceedWithoutArtifact => StageResult::ok(Vec::new(), 1),
            Behavior::Fail(code, stderr) => StageResult::new(
                StageOutcome::ProcessFailed {
                    exit_code: Some(code),
                    stderr: stderr.to_string(),
                    stdout: String::new(),
                    reason: format!("exited with code {code}"),
                },
                1,
            ),
            Behavior::Hang => {
                tokio::select! {
                    _ = params.cancel.cancelled() => StageResult::new(StageOutcome::Cancelled, 1),
                    _ = tokio::time::sleep(params.timeout) => StageResult::new(
                        StageOutcome::TimedOut {
                            elapsed_ms: params.timeout.as_millis() as u64,
                            stderr: "still working".into(),
                        },
                        1,
                    ),
                }
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            job_workspace: workspace.to_path_buf(),
            kind,
            input: params.input.clone(),
            timeout: params.timeout,
            outcome: result.outcome.clone(),
        });
        result
    }
}

fn write_artifacts(kind: StageKind, workspace: &Path) -> Vec<PathBuf> {
    let dir = workspace.join(kind.output_dir_name());
    std::fs::create_dir_all(&dir).unwrap();
    match kind {
        StageKind::StructureFromMotion => {
            let transforms = dir.join("transforms.json");
            std::fs::write(&transforms, "{}").unwrap();
            vec![transforms]
        }
        StageKind::NeuralFieldTraining => {
            let config = dir.join("config.yml");
            let ckpt = dir.join("step-000001000.ckpt");
            std::fs::write(&config, "method: instant-ngp").unwrap();
            std::fs::write(&ckpt, "weights").unwrap();
            vec![config, ckpt]
        }
        StageKind::Packaging => {
            let ply = dir.join("point_cloud.ply");
            std::fs::write(&ply, "ply\nformat ascii 1.0\n").unwrap();
            vec![ply]
        }
    }
}
