use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use webhook_relay::{
    client_router,
    init_logging,
    ClientConfig,
    ClientState,
    DeliveryConsumer,
    HttpForwarder,
    MetricsSink,
    RedisLog,
    RelayMetrics,
    RelayQueue,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = ClientConfig::parse();
    init_logging(config.log.log_json);
    config.validate()?;

    let log = RedisLog::connect(&config.log.redis_url)
        .await
        .with_context(|| format!("connecting to {}", config.log.redis_url))?;
    let queue = RelayQueue::new(Arc::new(log), config.log.queue_names(&config.consumer_name));
    let metrics: Arc<dyn MetricsSink> = Arc::new(RelayMetrics::new());

    let consumer = DeliveryConsumer::new(
        queue.clone(),
        Arc::new(HttpForwarder::new(config.forward_timeout())),
        metrics.clone(),
        config.consumer_config(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.admin_addr)
        .await
        .with_context(|| format!("binding {}", config.admin_addr))?;
    let admin = client_router(ClientState {
        queue: queue.clone(),
        metrics: metrics.clone(),
    });
    let admin_shutdown = shutdown.clone();
    let admin_handle = tokio::spawn(async move {
        axum::serve(listener, admin)
            .with_graceful_shutdown(admin_shutdown.cancelled_owned())
            .await
    });

    let reporter = tokio::spawn(report_metrics(
        queue,
        metrics,
        config.health_check_interval(),
        shutdown.clone(),
    ));

    tracing::info!(
        target_url = %config.local_webhook_url,
        admin = %config.admin_addr,
        consumer = %config.consumer_name,
        "relay client starting"
    );
    consumer.run(shutdown.clone()).await?;

    // The consumer only returns once shutdown was requested.
    shutdown.cancel();
    admin_handle.await?.context("admin server")?;
    reporter.await?;
    tracing::info!("relay client stopped");
    Ok(())
}

async fn report_metrics(
    queue: RelayQueue,
    metrics: Arc<dyn MetricsSink>,
    every: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let snapshot = metrics.snapshot();
        match (queue.queue_depth().await, queue.pending().await) {
            (Ok(depth), Ok(pending)) => tracing::info!(
                received = snapshot.webhooks_received,
                processed = snapshot.webhooks_processed,
                failed = snapshot.webhooks_failed,
                retried = snapshot.webhooks_retried,
                average_latency_ms = snapshot.average_latency_ms,
                queue_depth = depth,
                pending,
                "relay metrics"
            ),
            (Err(err), _) | (_, Err(err)) => tracing::warn!(error = %err, "health check failed"),
        }
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown requested");
    token.cancel();
}
