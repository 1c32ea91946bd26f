//! Work command - run queue workers until interrupted
//!
//! Usage:
//! ```bash
//! assay work --handler-url http://localhost:8080/analyze --workers 8
//! ```

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use assay_queue::{BackendKind, QueueConfig, QueueManager};

use super::open_store;
use crate::handler::HttpHandler;
use crate::{print_info, print_success, print_warning};

/// Arguments for the work command
#[derive(Args)]
pub struct WorkArgs {
    /// Analysis endpoint that receives each job payload
    #[arg(long, env = "ASSAY_HANDLER_URL")]
    handler_url: String,

    /// Number of concurrent workers (overrides ASSAY_WORKERS)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Per-request timeout for the analysis endpoint, in seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,
}

/// Run the work command
pub async fn run(args: WorkArgs, db: &str) -> Result<()> {
    let mut config = QueueConfig::from_env();
    if let Some(workers) = args.workers {
        config.concurrency = workers;
    }

    let store = open_store(db).await?;
    let handler = HttpHandler::new(args.handler_url, Duration::from_secs(args.timeout_secs))
        .context("failed to build HTTP client")?;
    let endpoint = handler.endpoint().to_string();

    let manager = QueueManager::start(config, Arc::new(handler), store)
        .await
        .context("failed to start queue")?;

    if manager.backend_kind() == BackendKind::Local {
        print_warning("Using the local backend: only jobs queued by this process will run");
    }
    print_success(&format!(
        "{} workers on the {} backend, forwarding jobs to {}",
        manager.workers(),
        manager.backend_kind(),
        endpoint
    ));

    shutdown_signal().await;

    print_info("Waiting for in-flight jobs to finish...");
    manager.shutdown().await;
    print_success("Workers stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
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
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
