//! Periodic cleanup of old terminal jobs.
//!
//! Deletes terminal jobs, with their outputs and uploads, once they
//! finished more than the configured retention period ago. Runs on a fixed
//! interval using `tokio::time::interval`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recon_core::JobId;
use recon_store::filter::MAX_LIMIT;
use recon_store::JobFilter;
use tokio_util::sync::CancellationToken;

use crate::manager::JobManager;

/// Run the retention loop until `cancel` is triggered.
pub async fn run(
    manager: Arc<JobManager>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_hours = retention.as_secs() / 3600,
        interval_secs = interval.as_secs(),
        "Output retention job started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Output retention job stopping");
                break;
            }
            _ = ticker.tick() => {
                let deleted = sweep(&manager, retention).await;
                if deleted > 0 {
                    tracing::info!(deleted, "Output retention: purged old jobs");
                } else {
                    tracing::debug!("Output retention: nothing to purge");
                }
            }
        }
    }
}

/// Delete every terminal job that finished more than `retention` ago.
/// Returns the number of jobs deleted.
pub async fn sweep(manager: &JobManager, retention: Duration) -> usize {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return 0;
    };
    let cutoff = Utc::now() - retention;

    let mut expired: Vec<JobId> = Vec::new();
    let mut offset = 0;
    loop {
        let page = manager
            .list(&JobFilter {
                finished_before: Some(cutoff),
                limit: Some(MAX_LIMIT),
                offset: Some(offset),
                ..JobFilter::default()
            })
            .await;
        if page.jobs.is_empty() {
            break;
        }
        offset += page.jobs.len();
        expired.extend(page.jobs.iter().map(|j| j.id));
    }

    let mut deleted = 0;
    for id in expired {
        match manager.delete(id).await {
            Ok(_) => deleted += 1,
            Err(e) => tracing::error!(job_id = %id, error = %e, "Output retention: delete failed"),
        }
    }
    deleted
}
