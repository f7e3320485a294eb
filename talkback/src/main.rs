use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use talkback::api::{ApiServer, AppState};
use talkback::clock::SystemClock;
use talkback::config::AppConfig;
use talkback::logging;
use talkback::pipeline::processors::{
    ElevenLabsSynthesizer, FfmpegTranscoder, OpenAiReplyGenerator, RhubarbExtractor,
};
use talkback::pipeline::{JobPurgeService, JobQueue, PipelineExecutor, WorkerPool};
use talkback::utils::http_client;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Resolves once Ctrl-C (or SIGTERM on unix) is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env_or_default().context("loading configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir).context("initializing logging")?;

    http_client::install_rustls_provider();

    info!(
        "talkback {} starting (workers: {}, max attempts: {})",
        env!("CARGO_PKG_VERSION"),
        config.workers.max_workers,
        config.queue.max_attempts
    );

    let job_queue = Arc::new(
        JobQueue::open(config.queue.clone(), Arc::new(SystemClock))
            .await
            .context("opening job queue")?,
    );

    // Jobs left active by a previous process become claimable once their lease lapses.
    match job_queue.reclaim_expired_leases().await {
        Ok(0) => {}
        Ok(n) => info!("Reclaimed {} jobs with expired leases", n),
        Err(e) => warn!("Failed to reclaim expired leases: {}", e),
    }

    let generator = OpenAiReplyGenerator::new(config.openai.clone())?;
    let synthesizer = ElevenLabsSynthesizer::new(config.eleven_labs.clone())?;
    let executor = Arc::new(PipelineExecutor::new(
        Arc::new(generator),
        Arc::new(synthesizer),
        Arc::new(FfmpegTranscoder::with_path(config.ffmpeg_path.clone())),
        Arc::new(RhubarbExtractor::with_path(config.rhubarb_path.clone())),
        config.artifacts_dir.clone(),
    ));

    let worker_pool = WorkerPool::with_config(config.workers.clone());
    worker_pool.start(job_queue.clone(), executor);

    let maintenance_token = CancellationToken::new();
    let purge_service = JobPurgeService::new(config.purge.clone(), job_queue.clone());
    let purge_task = purge_service.start_background_task(maintenance_token.clone());
    let log_cleanup_task = logging_config.start_retention_cleanup(maintenance_token.clone());

    let server = ApiServer::new(config.api.clone(), AppState::new(job_queue.clone()));
    let server_token = server.cancel_token();
    let mut server_task = tokio::spawn(async move { server.run().await });

    let server_result = tokio::select! {
        _ = shutdown_signal() => {
            server_token.cancel();
            (&mut server_task).await
        }
        result = &mut server_task => result,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server error: {}", e),
        Err(e) => error!("API server task panicked: {}", e),
    }

    worker_pool.stop().await;

    maintenance_token.cancel();
    let _ = purge_task.await;
    let _ = log_cleanup_task.await;

    job_queue.close().await;
    info!("talkback stopped");

    Ok(())
}
