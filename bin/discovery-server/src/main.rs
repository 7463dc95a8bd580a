use anyhow::Result;
use clap::Parser;
use discovery_balancer::{build_balancer, BroadcastHub};
use discovery_core::{ServiceRecord, ServiceRegistry};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use prometheus::IntGauge;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod forwarder;
mod metrics;
mod routes;
mod websocket;

use config::ServerConfig;
use metrics::DiscoveryMetrics;
use routes::{handle_request, AppState};
use websocket::SubscriberSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::parse();

    info!("Starting discovery-server...");

    let registry = Arc::new(ServiceRegistry::with_config(config.registry_config()));
    info!("Service registry initialized");

    let balancer = build_balancer(config.strategy, registry.clone());
    info!("Load balancer initialized: {}", config.strategy);

    let metrics = DiscoveryMetrics::new()?;
    info!("Metrics collector initialized");

    let (hub, hub_handle) = BroadcastHub::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(
        AppState::new(
            balancer,
            hub_handle.clone(),
            metrics.clone(),
            config.forward_timeout(),
        )
        .with_service_prefix(config.service_prefix())
        .with_key(config.shared_key()),
    );

    let hub_task = tokio::spawn(hub.run(wait_for_shutdown(shutdown_rx.clone())));

    tokio::spawn(track_subscribers(
        hub_handle.subscriber_count_watch(),
        metrics.connected_subscribers.clone(),
    ));

    // Liveness sweep; evictions are pushed to subscribers by the publisher below
    let evicted = Arc::new(Notify::new());
    let sweeper = {
        let registry = registry.clone();
        let evictions_total = metrics.evictions_total.clone();
        let evicted = evicted.clone();
        let interval = config.sweep_interval();
        let shutdown = wait_for_shutdown(shutdown_rx.clone());

        tokio::spawn(async move {
            registry
                .refresh_registry_with(interval, shutdown, move |records: &[ServiceRecord]| {
                    evictions_total.inc_by(records.len() as u64);
                    evicted.notify_one();
                })
                .await
        })
    };
    let publisher = tokio::spawn(publish_evictions(
        state.clone(),
        evicted,
        shutdown_rx.clone(),
    ));
    info!(
        "Liveness sweep every {:?} (grace {}s)",
        config.sweep_interval(),
        config.heartbeat_grace
    );

    let socket_addr = config.socket_addr()?;
    let socket_listener = TcpListener::bind(&socket_addr).await?;
    info!("WebSocket listener on {}", socket_addr);
    let socket_task = tokio::spawn(websocket::serve_subscribers(
        socket_listener,
        state.clone(),
        SubscriberSettings {
            capacity: config.subscriber_capacity,
            keepalive: config.keepalive(),
            write_timeout: config.write_timeout(),
        },
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let http_addr = config.http_addr()?;
    let http_listener = TcpListener::bind(&http_addr).await?;
    info!("HTTP server listening on {}", http_addr);
    info!("Proxying service requests under {}", config.service_prefix());

    serve_http(http_listener, state, shutdown_rx).await;

    let _ = tokio::join!(sweeper, publisher, socket_task);
    match hub_task.await {
        Ok(remaining) => info!("Broadcast hub closed {} subscriber queues", remaining),
        Err(e) => warn!("Broadcast hub task failed: {}", e),
    }

    info!("discovery-server stopped");
    Ok(())
}

/// Accept HTTP connections until shutdown
async fn serve_http(listener: TcpListener, state: Arc<AppState>, shutdown: watch::Receiver<bool>) {
    let stop = wait_for_shutdown(shutdown);
    tokio::pin!(stop);

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Error accepting HTTP connection: {}", e);
                    continue;
                }
            },
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }

    info!("HTTP server stopped");
}

/// Republish the snapshot whenever the sweep evicts something
async fn publish_evictions(
    state: Arc<AppState>,
    evicted: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
) {
    let stop = wait_for_shutdown(shutdown);
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = evicted.notified() => state.publish_snapshot().await,
        }
    }
}

/// Mirror the hub's subscriber count into the gauge
async fn track_subscribers(mut count: watch::Receiver<usize>, gauge: IntGauge) {
    loop {
        gauge.set(*count.borrow_and_update() as i64);
        if count.changed().await.is_err() {
            break;
        }
    }
}

/// Completes once shutdown is signalled or the sender is gone
pub(crate) async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
