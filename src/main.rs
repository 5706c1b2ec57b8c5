use anyhow::{Context, Result};
use geo_photo_cache::config::Config;
use geo_photo_cache::limiter::OutboundLimiter;
use geo_photo_cache::{handlers, Coordinator, FlickrClient, SqliteIndex};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(UtcTime::rfc_3339())
        .init();

    let config = Config::from_env()?;

    let index = SqliteIndex::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    let limiter = OutboundLimiter::new(config.rate_limit_requests, config.rate_limit_window());
    let client = FlickrClient::new(config.flickr_settings()?, limiter)?;
    let coordinator = Arc::new(Coordinator::new(
        index,
        client,
        config.coordinator_settings(),
    ));

    let mut changes = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => debug!(
                    location_id = %change.location_id,
                    inserted = change.inserted_ids().len(),
                    removed = change.removed_ids().len(),
                    total = change.after.len(),
                    "Photo set changed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let routes = handlers::routes(coordinator, config.request_timeout());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;
    let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    });

    info!("Server started at http://{}", addr);
    server.await;

    Ok(())
}
