//! Update Agent - Main entry point
//!
//! Keeps an application directory in step with its published releases and
//! exposes update control over HTTP.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use update_agent::{
    api, config::Config, daemon::shutdown::ShutdownCoordinator, host, layout::InstallLayout,
    scheduler, utils, UpdateManager,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, &config.log.output)?;

    // Initialize start time for uptime tracking
    api::health::init_start_time();

    tracing::info!(
        "Starting update-agent v{} (install dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.install_dir.display()
    );

    let layout = InstallLayout::new(&config.agent.install_dir);
    let restarter = host::restarter_for(config.update.service_name.as_deref());
    let manager = Arc::new(UpdateManager::open(config.update.clone(), layout, restarter).await?);

    // Determine port
    let port = args.port.unwrap_or(config.agent.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    // Create shutdown coordinator
    let shutdown_coordinator = ShutdownCoordinator::new();

    let scheduler_handle = scheduler::start_auto_check(manager.clone(), shutdown_coordinator.token());
    let confirm_handle = match config.update.auto_confirm_after_secs {
        Some(secs) => {
            scheduler::start_auto_confirm(
                manager.clone(),
                Duration::from_secs(secs),
                shutdown_coordinator.token(),
            )
            .await
        }
        None => None,
    };

    let app = api::create_router(manager);

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);
    tracing::info!("Update status: http://{}/api/update/status", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server_shutdown = shutdown_coordinator.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
    let server_handle = tokio::spawn(async move { server.await });

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await;

    for handle in [scheduler_handle, confirm_handle].into_iter().flatten() {
        let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;
    }

    // Wait for server to finish (with timeout)
    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}
