use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use webhook_relay::{
    init_logging,
    server_router,
    IngestionGateway,
    RedisLog,
    RelayMetrics,
    RelayQueue,
    ServerConfig,
    ServerState,
    StaticRoutes,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = ServerConfig::parse();
    init_logging(config.log.log_json);
    config.validate()?;

    let routes = match &config.routes_file {
        Some(path) => StaticRoutes::load(config.api_key.clone(), path)?,
        None => StaticRoutes::new(config.api_key.clone()),
    };
    tracing::info!(platforms = routes.platform_count(), "routes loaded");

    let log = RedisLog::connect(&config.log.redis_url)
        .await
        .with_context(|| format!("connecting to {}", config.log.redis_url))?;
    // The server only appends; the consumer name is never used for reads.
    let queue = RelayQueue::new(Arc::new(log), config.log.queue_names("relay-server"));
    queue.ensure_group().await.context("creating consumer group")?;

    let gateway = IngestionGateway::new(queue, Arc::new(routes), Arc::new(RelayMetrics::new()))
        .with_api_key_header(config.api_key_header.clone())
        .with_signature_header(config.signature_header.clone());
    let app = server_router(ServerState {
        gateway: Arc::new(gateway),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, stream = %config.log.stream_name, "relay server listening");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("http server")?;

    tracing::info!("relay server stopped");
    Ok(())
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
