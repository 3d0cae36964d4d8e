use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::client::ContainerClient;
use wakegate::config::Config;
use wakegate::docker::DockerRuntime;
use wakegate::orchestrator::Orchestrator;
use wakegate::proxy::ProxyServer;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let dotenv_path = dotenvy::dotenv().ok();

    // Load configuration: a TOML file if one is given, the environment otherwise
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match &config_path {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };

    let debug = match &config {
        Ok(config) => config.debug,
        Err(_) => std::env::var("WAKEGATE_DEBUG").map(|v| v == "true").unwrap_or(false),
    };
    init_logging(debug);

    let config = config.map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    match (&config_path, &dotenv_path) {
        (Some(path), _) => info!(path = %path.display(), "Configuration loaded from file"),
        (None, Some(env_file)) => info!(env_file = %env_file.display(), "Configuration loaded from environment"),
        (None, None) => info!("Configuration loaded from environment"),
    }

    print_startup_banner(&config);

    let bind_addr = config.bind_addr()?;

    let runtime = DockerRuntime::connect(config.docker_host.as_deref())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Docker");
            e
        })?;
    info!("Connected to Docker daemon");

    let client = Arc::new(ContainerClient::with_stop_timeout(
        Arc::new(runtime),
        config.stop_timeout,
    ));
    let orchestrator = Orchestrator::new(client, config.timeout).await.map_err(|e| {
        error!(error = %e, "Failed to list container groups");
        anyhow::Error::from(e)
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn inactivity sweep
    let sweep_handle = tokio::spawn(
        Arc::clone(&orchestrator).run_sweep_loop(config.sweep_interval, shutdown_rx.clone()),
    );

    // Spawn proxy server
    let proxy = ProxyServer::new(bind_addr, orchestrator, config.extractor, shutdown_rx);
    let routes = Arc::clone(proxy.routes());
    let mut proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
            return Err(e);
        }
        Ok(())
    });

    tokio::select! {
        signal = shutdown_signal() => {
            signal?;
        }
        result = &mut proxy_handle => {
            // The server only returns on its own when it failed to bind
            let _ = shutdown_tx.send(true);
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("Proxy server task failed: {}", e)),
            };
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout); containers are left as they are
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = sweep_handle.await;
    })
    .await;

    let stats = routes.pool().stats();
    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        cached_routes = routes.len(),
        "Shutdown complete"
    );
    Ok(())
}

fn init_logging(debug: bool) {
    let directive = if debug { "wakegate=debug" } else { "wakegate=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting on-demand container proxy");
    info!(
        bind = %config.bind,
        port = config.port,
        extractor = %config.extractor,
        "Server configuration"
    );
    info!(
        inactivity_timeout_secs = config.timeout.as_secs(),
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        stop_timeout_secs = config.stop_timeout.as_secs(),
        "Lifecycle settings"
    );
}
