use std::sync::Arc;

use recon_pipeline::CommandStageRunner;
use recon_worker::{retention, JobManager, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run the reconstruction worker.
///
/// Any command-line arguments are submitted as input directories (relative
/// to the uploads area) once the worker is up.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "recon_worker=debug,recon_pipeline=debug,recon_store=info".into()
            }),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        uploads = %config.upload_dir.display(),
        nerf_method = %config.tools.nerf_method,
        sfm_timeout_secs = config.sfm_timeout.as_secs(),
        training_timeout_secs = config.training_timeout.as_secs(),
        "Loaded worker configuration",
    );

    // --- Manager ---
    let runner = Arc::new(CommandStageRunner::new(config.tools.clone()));
    let manager = JobManager::open(config.clone(), runner).await?;

    let shutdown = CancellationToken::new();
    let worker = manager.spawn_worker(shutdown.clone());

    let retention_task = config.output_retention.map(|retention| {
        tokio::spawn(retention::run(
            Arc::clone(&manager),
            retention,
            config.retention_interval,
            shutdown.clone(),
        ))
    });

    for input in std::env::args().skip(1) {
        match manager.submit(&input).await {
            Ok(job_id) => tracing::info!(%job_id, input = %input, "Submitted job"),
            Err(e) => tracing::error!(input = %input, error = %e, "Submission rejected"),
        }
    }

    shutdown_signal().await;
    shutdown.cancel();

    worker.await?;
    if let Some(task) = retention_task {
        task.await?;
    }
    tracing::info!("Worker shut down");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), stopping worker");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, stopping worker");
        }
    }
}
