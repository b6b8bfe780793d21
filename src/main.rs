use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use argus::config::{self, Config};
use argus::events::LogSink;
use argus::metrics;
use argus::notify::LogNotifier;
use argus::registry::HostRegistry;
use argus::rpc::{CircuitBreaker, RpcClient};
use argus::supervisor::Supervisor;
use argus::workers::MemoryWorkerStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();

    info!(
        client_bin = %config.rpc.client_bin,
        default_host = %config.rpc.default_host_id(),
        heartbeat_ms = config.heartbeat.interval_ms,
        "Argus fleet supervisor starting"
    );

    // Wire the control plane. The registry doubles as the host-error
    // sink for the RPC client.
    let registry = Arc::new(HostRegistry::with_failure_threshold(
        config.heartbeat.failure_threshold,
    ));
    let breaker = Arc::new(CircuitBreaker::new(config.rpc.breaker.clone()));
    let client = Arc::new(RpcClient::new(
        config.rpc.clone(),
        breaker.clone(),
        registry.clone(),
    ));
    let workers = Arc::new(MemoryWorkerStore::new());

    let supervisor = Arc::new(Supervisor::new(
        config.clone(),
        registry,
        workers,
        client,
        breaker,
        Arc::new(LogSink),
        Arc::new(LogNotifier),
    ));

    // Start metrics server in background
    if config.metrics.enabled {
        let metrics_addr = format!("{}:{}", config.metrics.listen_addr, config.metrics.listen_port);
        info!(metrics_addr = %metrics_addr, "Metrics server starting");
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(&metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    supervisor.start();

    shutdown_signal().await;
    info!("Shutdown signal received");

    supervisor.stop();
    info!("Argus fleet supervisor shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_or_default_config() -> Config {
    // Try to load from config file
    let config_paths = ["config/argus.toml", "argus.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(error = %e, "Config file not usable");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
