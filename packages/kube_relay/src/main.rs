use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cluster;
mod config;
mod error;
mod handlers;
mod metrics;
mod relay;
mod retry;
#[cfg(test)]
mod test_helpers;

use crate::cluster::ClusterClient;
use crate::config::{ClusterConfig, FileConfig, RelayConfig, load_config};
use crate::metrics::ServerMetrics;
use crate::relay::RelayHub;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "kube-relay")]
#[command(about = "Real-time relay between a Kubernetes dashboard and the cluster API")]
struct Cli {
    /// Path to the TOML config file (missing file means defaults)
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Host to bind to (overrides [server] host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (overrides [server] port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub hub: RelayHub,
    pub metrics: Arc<ServerMetrics>,
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::relay_websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/topics", get(handlers::list_topics))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // reqwest and the exec client share one rustls provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Setup logging
    let default_directive = if cli.debug {
        "kube_relay=debug,exec_channel=debug,tower_http=debug,info"
    } else {
        "kube_relay=info,exec_channel=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting kube-relay");

    let mut file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }

    let cluster = ClusterConfig::from_file(&file_config)?;
    let client = Arc::new(ClusterClient::new(cluster)?);
    info!("Cluster API server: {}", client.api_server());

    let metrics = Arc::new(ServerMetrics::new());
    let hub = RelayHub::new(
        client.clone(),
        client,
        &RelayConfig::from_file(&file_config),
        metrics.clone(),
    );
    let janitor = hub.spawn_janitor();

    let app = build_router(AppState {
        hub: hub.clone(),
        metrics,
    });

    let addr = format!("{}:{}", file_config.server.host, file_config.server.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("kube-relay listening on http://{}", actual_addr);
    info!("  GET /ws          - Dashboard WebSocket");
    info!("  GET /health      - Health summary");
    info!("  GET /metrics     - Server metrics");
    info!("  GET /api/topics  - Active watch topics");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    hub.shutdown().await;
    if let Err(e) = janitor.await {
        warn!("Janitor task ended abnormally: {}", e);
    }

    info!("Shutdown complete");
    server_result
}
