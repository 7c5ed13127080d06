//! Inference Gateway - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use inference_gateway::{
    Registry, Router, StateManager, Supervisor, SystemProcessManager, api, config::GatewayConfig,
    metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "inference-gateway")]
#[command(about = "Local model inference gateway", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override management listener port
    #[arg(long)]
    management_port: Option<u16>,

    /// Override inference listener port
    #[arg(long)]
    inference_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Inference Gateway");

    // Load configuration
    let mut config = GatewayConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.management_port {
        config.management_port = port;
    }
    if let Some(port) = cli.inference_port {
        config.inference_port = port;
    }

    config.validate()?;

    tracing::info!(
        management_port = config.management_port,
        inference_port = config.inference_port,
        state_file = ?config.state_file,
        worker_binary = %config.worker_binary_path,
        max_models = ?config.max_models,
        "Configuration loaded"
    );

    let prometheus_handle = metrics::setup_metrics()?;

    let registry = Arc::new(
        Registry::new(config.max_models, config.default_queue_depth)
            .with_instance_limit(config.worker_port_capacity()),
    );
    let supervisor = Supervisor::new(
        registry.clone(),
        Arc::new(SystemProcessManager::new()),
        config.supervisor_settings(),
    );
    let router = Arc::new(Router::new(
        registry.clone(),
        supervisor.clone(),
        config.router_settings(),
    ));
    let state_manager = Arc::new(StateManager::new(
        config.state_file.clone(),
        registry.clone(),
        supervisor.clone(),
    ));

    // Restore models or seed from config
    if config.auto_restore_on_restart {
        tracing::info!("Auto-restore enabled, restoring models from state");
        state_manager.restore().await?;
    } else if !config.models.is_empty() {
        tracing::info!(count = config.models.len(), "Seeding models from config");
        state_manager.seed(std::mem::take(&mut config.models)).await;
    }
    metrics::update_model_count(registry.count());

    let app_state = api::AppState {
        registry: registry.clone(),
        supervisor: supervisor.clone(),
        router,
        state_manager: state_manager.clone(),
        prometheus_handle,
    };

    let management_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.management_port));
    let inference_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.inference_port));

    let management_listener = tokio::net::TcpListener::bind(management_addr)
        .await
        .context("Failed to bind management listener")?;
    let inference_listener = tokio::net::TcpListener::bind(inference_addr)
        .await
        .context("Failed to bind inference listener")?;

    tracing::info!(
        management = %management_addr,
        inference = %inference_addr,
        "Listeners bound"
    );

    // One signal stops both listeners
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let management = axum::serve(
        management_listener,
        api::create_management_router(app_state.clone()),
    )
    .with_graceful_shutdown(wait_for(shutdown_rx.clone()));
    let inference = axum::serve(
        inference_listener,
        api::create_inference_router(app_state),
    )
    .with_graceful_shutdown(wait_for(shutdown_rx));

    let (management_result, inference_result) = tokio::join!(
        async { management.await.context("Management server error") },
        async { inference.await.context("Inference server error") },
    );

    tracing::info!("Shutting down...");

    // Stop all workers, then persist what is registered
    supervisor
        .shutdown(std::time::Duration::from_millis(config.shutdown_grace_ms))
        .await;

    tracing::info!("Saving final state");
    state_manager.save().await?;

    management_result?;
    inference_result?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    // An error means the sender is gone, which also means shut down
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
