use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use herald_common::config::AppConfig;
use herald_engine::{BreakerConfig, CircuitBreaker, DeliveryPipeline, RetryPolicy, StatusReporter};
use herald_notifier::consumer::{Consumer, ConsumerConfig};
use herald_notifier::fcm::{FcmGateway, ServiceAccount};
use herald_notifier::health::{self, HealthState};
use herald_notifier::owner::OwnerServiceClient;
use herald_notifier::queue::{QueueTopology, RedisQueue};

/// Time allowed for queued status reports to flush after the consumer stops.
const REPORTER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald push notifier starting...");

    let config = AppConfig::from_env()?;
    let shutdown = CancellationToken::new();

    // Gateway and breaker
    let account = ServiceAccount::load(&config)?;
    tracing::info!(project_id = %account.project_id, "Loaded Firebase service account");
    let gateway = Arc::new(FcmGateway::new(
        account,
        Duration::from_millis(config.fcm_timeout_ms),
    )?);
    let breaker = Arc::new(CircuitBreaker::new("fcm", BreakerConfig::from(&config)));

    // Owning service: status sink and device directory
    let owner = Arc::new(OwnerServiceClient::new(
        &config.owner_service_url,
        Duration::from_millis(config.fcm_timeout_ms),
    )?);
    let (reporter, reporter_task) =
        StatusReporter::spawn(owner.clone(), config.reporter_queue_capacity);

    let pipeline = Arc::new(DeliveryPipeline::new(
        gateway,
        breaker.clone(),
        RetryPolicy::from(&config),
        reporter,
        shutdown.clone(),
    ));

    // Queue
    let topology = QueueTopology::from_config(&config);
    let queue = Arc::new(RedisQueue::connect(&config.redis_url, topology).await?);
    queue.recover_in_flight().await?;

    let consumer = Consumer::new(
        queue.clone(),
        owner,
        pipeline.clone(),
        ConsumerConfig::from(&config),
        shutdown.clone(),
    );
    let consumer_task = tokio::spawn(consumer.run());

    // Health endpoint
    let app = health::router(HealthState {
        queue,
        breaker,
        stats: pipeline.stats().clone(),
    })
    .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.health_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Health endpoint listening");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    shutdown_signal().await;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown.cancel();

    if let Err(e) = consumer_task.await {
        tracing::error!(error = %e, "Consumer task failed");
    }

    // Dropping the last pipeline handle closes the reporter channel.
    drop(pipeline);
    if tokio::time::timeout(REPORTER_FLUSH_TIMEOUT, reporter_task)
        .await
        .is_err()
    {
        tracing::warn!("Status reporter did not flush before timeout");
    }

    match server.await {
        Ok(Err(e)) => tracing::error!(error = %e, "Health server exited with error"),
        Err(e) => tracing::error!(error = %e, "Health server task failed"),
        Ok(Ok(())) => {}
    }

    tracing::info!("Herald push notifier stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
