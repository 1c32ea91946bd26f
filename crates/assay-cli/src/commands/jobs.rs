//! Job commands - enqueue, status and cancel
//!
//! Usage:
//! ```bash
//! assay enqueue '{"file": "uploads/labs.pdf"}' --max-attempts 5
//! assay status <job-id> --json
//! assay cancel <job-id>
//! ```

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use uuid::Uuid;

use assay_queue::{BackendKind, JobSnapshot, JobStatus, QueueError};

use super::producer;
use crate::{print_error, print_success};

/// Arguments for the enqueue command
#[derive(Args)]
pub struct EnqueueArgs {
    /// Job payload as JSON
    payload: String,

    /// Attempts before the job is marked failed (overrides ASSAY_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,
}

/// Arguments for commands that address one job
#[derive(Args)]
pub struct JobArgs {
    /// Job id
    id: Uuid,

    /// Output raw JSON (no formatting)
    #[arg(long)]
    json: bool,
}

pub async fn enqueue(args: EnqueueArgs, db: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;

    let manager = producer(db).await?;
    if manager.backend_kind() == BackendKind::Local {
        bail!("no shared queue is reachable; set ASSAY_REDIS_URL so workers can see the job");
    }

    let id = manager.enqueue(payload, args.max_attempts).await?;
    print_success(&format!("Queued job {}", id.to_string().cyan()));
    Ok(())
}

pub async fn status(args: JobArgs, db: &str) -> Result<()> {
    let manager = producer(db).await?;
    let snapshot = match manager.status(args.id).await {
        Ok(snapshot) => snapshot,
        Err(QueueError::NotFound) => {
            print_error(&format!("Job {} not found", args.id));
            bail!("job not found");
        }
        Err(e) => return Err(e.into()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot)?;
    }
    Ok(())
}

pub async fn cancel(args: JobArgs, db: &str) -> Result<()> {
    let manager = producer(db).await?;
    match manager.cancel(args.id).await {
        Ok(()) => {
            if args.json {
                println!("{}", serde_json::json!({ "id": args.id, "cancelled": true }));
            } else {
                print_success(&format!("Cancelled job {}", args.id));
            }
            Ok(())
        }
        Err(QueueError::CannotCancel(status)) => {
            print_error(&format!("Job {} is already {}", args.id, status));
            bail!("job cannot be cancelled");
        }
        Err(QueueError::NotFound) => {
            print_error(&format!("Job {} not found", args.id));
            bail!("job not found");
        }
        Err(e) => Err(e.into()),
    }
}

fn colored_status(status: JobStatus) -> colored::ColoredString {
    match status {
        JobStatus::Pending => status.as_str().yellow(),
        JobStatus::Running => status.as_str().blue(),
        JobStatus::Completed => status.as_str().green(),
        JobStatus::Failed => status.as_str().red(),
        JobStatus::Cancelled => status.as_str().dimmed(),
    }
}

fn print_snapshot(snapshot: &JobSnapshot) -> Result<()> {
    println!("{} {}", "Job".bold(), snapshot.id.to_string().cyan());
    println!("  {} {}", "Status:".dimmed(), colored_status(snapshot.status));
    if let (Some(attempts), Some(max)) = (snapshot.attempts, snapshot.max_attempts) {
        println!("  {} {}/{}", "Attempts:".dimmed(), attempts, max);
    }
    if let Some(created) = snapshot.created_at {
        println!("  {} {}", "Created:".dimmed(), created.to_rfc3339());
    }
    if let Some(updated) = snapshot.updated_at {
        println!("  {} {}", "Updated:".dimmed(), updated.to_rfc3339());
    }
    if let Some(error) = &snapshot.error {
        println!("  {} {}", "Error:".dimmed(), error.red());
    }
    if let Some(result) = &snapshot.result {
        println!("  {}", "Result:".dimmed());
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}
