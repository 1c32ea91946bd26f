//! Assay CLI - run queue workers and manage analysis jobs
//!
//! # Usage
//!
//! ```bash
//! # Run workers against the configured queue
//! ASSAY_REDIS_URL=redis://localhost:6379 assay work --handler-url http://localhost:8080/analyze
//!
//! # Queue a job and follow it
//! assay enqueue '{"file": "uploads/labs.pdf", "query": "summarize"}'
//! assay status 4b0c6f5e-2a4e-4f7a-9d59-8d3c8e0c2d11
//! assay cancel 4b0c6f5e-2a4e-4f7a-9d59-8d3c8e0c2d11
//!
//! # Inspect the queue
//! assay stats
//! assay health
//! ```
//!
//! Queue settings come from `ASSAY_*` environment variables.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;
mod handler;

use commands::{info, jobs, work};

/// Assay - background analysis job queue
#[derive(Parser)]
#[command(
    name = "assay",
    version,
    about = "Assay CLI - background analysis job queue",
    long_about = "Runs queue workers and manages analysis jobs.\n\n\
                  Queue backend, concurrency and retry settings are read\n\
                  from ASSAY_* environment variables."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Result store database URL
    #[arg(
        long,
        env = "ASSAY_RESULTS_DB",
        default_value = "sqlite:assay.db?mode=rwc",
        global = true
    )]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers until interrupted
    #[command(name = "work")]
    Work(work::WorkArgs),

    /// Queue a new job
    #[command(name = "enqueue")]
    Enqueue(jobs::EnqueueArgs),

    /// Show a job's lifecycle state
    #[command(name = "status")]
    Status(jobs::JobArgs),

    /// Cancel a pending or running job
    #[command(name = "cancel")]
    Cancel(jobs::JobArgs),

    /// Show job counts per state
    #[command(name = "stats")]
    Stats,

    /// Check backend and result store connectivity
    #[command(name = "health")]
    Health,

    /// Show the effective queue configuration
    #[command(name = "info")]
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing based on verbosity
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Work(args) => work::run(args, &cli.db).await,
        Commands::Enqueue(args) => jobs::enqueue(args, &cli.db).await,
        Commands::Status(args) => jobs::status(args, &cli.db).await,
        Commands::Cancel(args) => jobs::cancel(args, &cli.db).await,
        Commands::Stats => info::stats(&cli.db).await,
        Commands::Health => info::health(&cli.db).await,
        Commands::Info => info::run(),
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message with an X
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print an info message
pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue().bold(), msg);
}
