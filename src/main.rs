use caddygate::admin::AdminServer;
use caddygate::caddy::CaddyManager;
use caddygate::config::Config;
use caddygate::diagnostics::Diagnostics;
use caddygate::registry::Registry;
use caddygate::supervisor::Supervisor;
use caddygate::sync::Synchronizer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("caddygate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");

    std::fs::create_dir_all(&config.paths.data_dir)?;
    std::fs::create_dir_all(config.paths.log_dir())?;

    // Registry
    let registry = Arc::new(Registry::open(config.paths.database_path())?);

    // Caddy driver
    let caddy = Arc::new(CaddyManager::new(
        config.paths.caddy_bin.clone(),
        config.paths.caddyfile_path(),
        config.paths.caddy_log_path(),
    ));
    caddy.ensure_default_config()?;
    if let Err(e) = caddy.start().await {
        warn!(error = %e, "Caddy did not start; proxy routes are inactive until it does");
    }

    // Synchronizer and supervisor
    let sync = Synchronizer::new(Arc::clone(&registry), Arc::clone(&caddy));
    let supervisor = Supervisor::new(
        Arc::clone(&registry),
        Arc::clone(&sync),
        config.supervisor.clone(),
        config.paths.clone(),
    );

    // Records marked running from a previous daemon instance are stale
    let reconciled = supervisor.reconcile_startup()?;
    if reconciled > 0 {
        info!(count = reconciled, "Cleared stale running statuses");
    }

    // Establish the first configuration generation, then bring up
    // auto-start projects (each start triggers its own re-sync)
    if let Err(e) = sync.synchronize().await {
        warn!(error = %e, "Initial proxy synchronization failed");
    }
    let started = supervisor.auto_start_all().await;
    if started > 0 {
        info!(count = started, "Auto-started projects");
    }

    let diagnostics = Arc::new(Diagnostics::new(
        Arc::clone(&registry),
        Arc::clone(&caddy),
        Arc::clone(&sync),
        config.diagnostics.clone(),
    ));

    // Admin API
    let token = config.server.admin_token.clone().unwrap_or_else(|| {
        let generated = uuid::Uuid::new_v4().to_string();
        info!(token = %generated, "No admin token configured; generated one for this run");
        generated
    });
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid admin bind address: {e}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let admin = Arc::new(AdminServer::new(
        bind_addr,
        token,
        Arc::clone(&supervisor),
        Arc::clone(&caddy),
        Arc::clone(&sync),
        diagnostics,
        shutdown_rx,
    ));
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin.run().await {
            error!(error = %e, "Admin API server error");
        }
    });

    // Wait for shutdown signals; SIGHUP forces a re-synchronization
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, re-synchronizing proxy configuration...");
                    if let Err(e) = sync.synchronize().await {
                        error!(error = %e, "Synchronization failed");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all projects...");
    supervisor.stop_all().await;

    info!("Stopping Caddy...");
    caddy.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("Shutdown complete");
    Ok(())
}
