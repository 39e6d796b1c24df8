//! `queue-agent` -- runs inference jobs from a queue on a local backend.
//!
//! Long-polls the job queue, drives the configured backend for each job,
//! uploads artifacts to the blob store and publishes the outcome to the
//! result topic. See [`WorkerConfig::from_env`] for the environment.

use queue_agent::config::WorkerConfig;
use queue_agent::notify::SnsNotifier;
use queue_agent::queue::SqsQueue;
use queue_agent::shutdown;
use queue_agent::storage::S3BlobStore;
use queue_agent::worker::{Worker, WorkerSettings};
use queue_agent_comfyui::runtime::ComfyUIRuntime;
use queue_agent_core::runtime::{Runtime, RuntimeKind};

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();
    let default_filter = match &config {
        Ok(config) => config.log_filter(),
        Err(_) => "queue_agent=info".to_string(),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });
    config.log_summary();

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let aws = loader.load().await;

    let mut runtime: Box<dyn Runtime> = match config.runtime_kind {
        RuntimeKind::ComfyUI => Box::new(ComfyUIRuntime::new(&config.api_base_url)),
        other => {
            tracing::error!(runtime_type = %other, "Unsupported runtime type");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.check_readiness().await {
        tracing::error!(error = %e, "Backend readiness check failed");
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    let signals = shutdown::cancel_on_signal(cancel.clone());

    let mut worker = Worker::new(
        Box::new(SqsQueue::new(aws_sdk_sqs::Client::new(&aws), &config.queue_url)),
        Box::new(SnsNotifier::new(aws_sdk_sns::Client::new(&aws), &config.topic_arn)),
        Box::new(S3BlobStore::new(aws_sdk_s3::Client::new(&aws), &config.bucket)),
        runtime,
        WorkerSettings::from(&config),
    );

    worker.run(cancel).await;
    signals.abort();

    tracing::info!("Shutting down");
}
