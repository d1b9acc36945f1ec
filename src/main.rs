//! Egress Gateway - Entry Point
//!
//! Starts the proxy listener and the metrics server with graceful shutdown support.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use egress_gateway::api::{ApiServer, AppState};
use egress_gateway::config::{config_path, Config, LogConfig};
use egress_gateway::metrics::Metrics;
use egress_gateway::proxy::{
    EndpointTable, GatewayHandler, GatewayHandlerConfig, LeastRecentlyUsedSelector,
    ProxySelector, ProxyServer, TransportCache, TransportConfig, TransportSweeper, WorkerPool,
};
use egress_gateway::proxy::server::bind;
use egress_gateway::repository::ProxyRepository;

#[tokio::main]
async fn main() -> egress_gateway::Result<()> {
    init_tracing(&LogConfig::from_env());

    info!("Starting egress gateway");

    // Load configuration
    let path = config_path();
    let config = Config::load(&path)?;
    info!(path = %path, "Configuration loaded");

    // Load the egress pool; an empty pool is fatal before anything binds
    let proxies = ProxyRepository::new(&config.proxies_file).get_all().await?;
    let selector: Arc<dyn ProxySelector> = match LeastRecentlyUsedSelector::new(proxies) {
        Ok(selector) => Arc::new(selector),
        Err(e) => {
            error!(file = %config.proxies_file, "No egress proxies loaded");
            return Err(e);
        }
    };
    info!(
        "Using rotation strategy {} over {} proxies",
        selector.strategy_name(),
        selector.total_count()
    );

    let endpoints = Arc::new(EndpointTable::new(config.endpoints.clone()));
    let metrics = Arc::new(Metrics::new());

    // Bind both listeners before anything is spawned; either failing is fatal
    let proxy_listener = bind(&config.proxy_addr()).await?;
    let api_listener = bind(&config.metrics_bind_addr()).await?;

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Outbound transports and their periodic sweep
    let transports = Arc::new(TransportCache::new(TransportConfig {
        request_timeout: config.request_timeout(),
        connect_timeout: Duration::from_secs(5),
    }));
    let sweeper = TransportSweeper::new(transports.clone(), config.sweep_interval());
    let sweeper_shutdown = shutdown_tx.subscribe();
    let sweeper_task = tokio::spawn(async move {
        sweeper.run(sweeper_shutdown).await;
    });

    let handler = Arc::new(GatewayHandler::new(
        selector.clone(),
        transports,
        endpoints.clone(),
        metrics.clone(),
        GatewayHandlerConfig {
            request_timeout: config.request_timeout(),
            relay_buffer_size: config.relay_buffer_size,
        },
    ));
    let workers = Arc::new(WorkerPool::start(
        handler,
        config.worker_count,
        config.queue_capacity(),
    ));

    let proxy_server = ProxyServer::new(workers, selector.clone(), metrics.clone());
    let api_server = ApiServer::new(AppState {
        metrics,
        selector,
        endpoints: endpoints.clone(),
    });

    // Start servers
    let proxy_shutdown = shutdown_tx.subscribe();
    let api_shutdown = shutdown_tx.subscribe();

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.serve(proxy_listener, proxy_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.serve(api_listener, api_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!(
        "Servers started - Proxy: {}, Metrics: {}, Workers: {}",
        config.proxy_addr(),
        config.metrics_bind_addr(),
        config.worker_count
    );
    for (name, base) in endpoints.iter() {
        info!("  /{}/ -> {}", name, base);
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);

    // Wait for all tasks to complete
    let _ = tokio::join!(proxy_task, api_task, sweeper_task);

    info!("Egress gateway stopped");
    Ok(())
}

fn init_tracing(log_config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("egress_gateway={},tower_http=debug", log_config.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if log_config.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
