//! FIFO job queue with a single worker slot.
//!
//! The queue hands out at most one [`JobLease`] at a time. The next job is
//! not released until the current lease is dropped, which the manager does
//! only after the leased job's terminal state has been stored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use recon_core::JobId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Result of [`JobQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCancel {
    /// The job was waiting and has been removed from the queue.
    Removed,
    /// The job holds the worker slot; its cancellation token was triggered.
    Signalled,
    /// The queue does not know the job.
    Unknown,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    active: Option<(JobId, CancellationToken)>,
}

#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append `id` to the back of the queue.
    pub fn enqueue(&self, id: JobId) {
        {
            let mut state = self.lock();
            if state.pending.contains(&id) || state.active.as_ref().is_some_and(|(a, _)| *a == id) {
                return;
            }
            state.pending.push_back(id);
        }
        self.notify.notify_waiters();
    }

    /// Wait until a job is queued and the worker slot is free, then lease
    /// the oldest job. Returns `None` once `shutdown` is cancelled.
    ///
    /// The lease's cancellation token is a child of `shutdown`, so shutting
    /// down also cancels the leased job's in-flight stage.
    pub async fn dequeue_blocking(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> Option<JobLease> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent enqueue is not missed.
            notified.as_mut().enable();

            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(lease) = self.try_lease(shutdown) {
                return Some(lease);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Remove a waiting job, or signal the running one.
    pub fn cancel(&self, id: JobId) -> QueueCancel {
        let mut state = self.lock();
        if let Some(pos) = state.pending.iter().position(|p| *p == id) {
            state.pending.remove(pos);
            return QueueCancel::Removed;
        }
        match &state.active {
            Some((active, token)) if *active == id => {
                token.cancel();
                QueueCancel::Signalled
            }
            _ => QueueCancel::Unknown,
        }
    }

    /// Number of jobs waiting for the worker slot.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn try_lease(self: &Arc<Self>, shutdown: &CancellationToken) -> Option<JobLease> {
        let mut state = self.lock();
        if state.active.is_some() {
            return None;
        }
        let id = state.pending.pop_front()?;
        let cancel = shutdown.child_token();
        state.active = Some((id, cancel.clone()));
        Some(JobLease {
            id,
            cancel,
            queue: Arc::clone(self),
        })
    }

    fn release(&self, id: JobId) {
        {
            let mut state = self.lock();
            if state.active.as_ref().is_some_and(|(active, _)| *active == id) {
                state.active = None;
            }
        }
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is always left consistent, so a poisoned lock is usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive right to run one job. Dropping the lease frees the worker slot.
pub struct JobLease {
    id: JobId,
    cancel: CancellationToken,
    queue: Arc<JobQueue>,
}

impl JobLease {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.queue.release(self.id);
    }
}

impl std::fmt::Debug for JobLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLease")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
