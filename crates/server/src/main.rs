//! stampede entry point.
//!
//! Boots the caching proxy on the configured address. Logging goes to stderr
//! as JSON.

use std::sync::Arc;

use anyhow::Result;
use stampede_client::{FetchConfig, UpstreamClient};
use stampede_core::config::AppConfig;
use stampede_core::{Action, CacheStore, Metrics, Volume};
use stampede_server::bridge::{Bridge, PURGE_CACHE, PurgeHandler, UdpTransport};
use stampede_server::http::router;
use stampede_server::proxy::{HostRewriter, Proxy};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        listen = %config.listen_addr,
        root = %config.root_dir.display(),
        upstream = config.upstream.as_deref().unwrap_or("<host header>"),
        "Starting stampede"
    );

    let metrics = Arc::new(Metrics::new(config.metrics_frames));
    let store = Arc::new(CacheStore::new(config.store_config()));
    let client = UpstreamClient::new(FetchConfig { max_bytes: config.max_body_bytes, ..Default::default() })?
        .with_metrics(Arc::clone(&metrics));

    let mut bridge =
        Bridge::new().on(PURGE_CACHE, Arc::new(PurgeHandler::new(Arc::clone(&store), Arc::clone(&metrics))));
    let udp = match config.bridge_bind {
        Some(addr) => {
            let transport = Arc::new(UdpTransport::bind(addr, config.bridge_peers.iter().copied()).await?);
            bridge = bridge.with_transport(transport.clone());
            Some(transport)
        }
        None => None,
    };
    let bridge = Arc::new(bridge);
    if let Some(transport) = &udp {
        transport.spawn_listener(Arc::clone(&bridge));
    }

    let mut builder = Proxy::builder(store, client)
        .fingerprint_capacity(config.fingerprint_capacity())
        .bridge(bridge)
        .metrics(Arc::clone(&metrics))
        .timeout(config.timeout());
    if let Some(upstream) = &config.upstream {
        builder = builder.rewriter(Arc::new(HostRewriter::new(upstream.as_str())));
    }
    let proxy = builder.build();

    metrics.spawn_flusher(config.metrics_flush_period(), |frame| {
        tracing::info!(
            requests = frame.action(Action::Total),
            cache_fetch = frame.action(Action::CacheFetch),
            cache_fetch_error = frame.action(Action::CacheFetchError),
            cache_write = frame.action(Action::CacheWrite),
            flights = frame.action(Action::FlightCreated),
            waiters = frame.action(Action::WaiterInserted),
            upstream_fetch = frame.action(Action::UpstreamFetch),
            upstream_timeout = frame.action(Action::UpstreamTimeout),
            upstream_bytes = frame.bytes(Volume::UpstreamFetch),
            cache_bytes = frame.bytes(Volume::CacheFetch),
            "metrics frame"
        );
    });

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(proxy)).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
