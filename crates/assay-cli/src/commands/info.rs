//! Info commands - queue statistics, health and configuration
//!
//! Usage:
//! ```bash
//! assay stats
//! assay health
//! assay info
//! ```

use anyhow::{bail, Context, Result};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use assay_queue::{BackoffStrategy, QueueConfig, QueueManager};

use super::{open_store, producer};
use crate::{print_error, print_info, print_success};

pub async fn stats(db: &str) -> Result<()> {
    let manager = producer(db).await?;
    let stats = manager.stats().await?;

    println!("{} ({} backend)", "Queue statistics".bold().cyan(), stats.backend);
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("State").fg(Color::Cyan),
            Cell::new("Jobs").fg(Color::Cyan),
        ]);
    for (state, count, color) in [
        ("pending", stats.pending, Color::Yellow),
        ("running", stats.running, Color::Blue),
        ("completed", stats.completed, Color::Green),
        ("failed", stats.failed, Color::Red),
        ("cancelled", stats.cancelled, Color::Grey),
    ] {
        table.add_row(vec![Cell::new(state).fg(color), Cell::new(count)]);
    }
    println!("{table}");

    print_info("Finished counts on the remote backend are totals since the queue was created");
    Ok(())
}

pub async fn health(db: &str) -> Result<()> {
    let store = open_store(db).await?;
    let store_ok = store.is_healthy().await;
    let manager = QueueManager::producer(QueueConfig::from_env(), store)
        .await
        .context("failed to connect to queue backend")?;
    let queue = manager.health().await;

    if queue.healthy {
        print_success(&format!("Queue backend ({}) is reachable", queue.backend));
    } else {
        print_error(&format!(
            "Queue backend ({}) is unhealthy: {}",
            queue.backend,
            queue.error.as_deref().unwrap_or("unknown error")
        ));
    }
    if store_ok {
        print_success("Result store is reachable");
    } else {
        print_error("Result store is unreachable");
    }

    if !(queue.healthy && store_ok) {
        bail!("health check failed");
    }
    Ok(())
}

/// Print the configuration the queue would start with
pub fn run() -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let config = QueueConfig::from_env();
    config.validate()?;

    println!("{}", "Assay - background analysis job queue".bold().cyan());
    println!("{}", "═".repeat(50).cyan());
    println!();

    println!("{}", "Version Information:".bold());
    println!("  {} {}", "CLI Version:".dimmed(), version.green());
    println!();

    println!("{}", "Queue:".bold());
    println!("  {} {}", "Backend:".dimmed(), config.backend.as_str().green());
    if let Some(url) = &config.redis_url {
        println!("  {} {}", "Redis:".dimmed(), redact_url(url));
        println!("  {} {}", "Key prefix:".dimmed(), config.key_prefix);
        println!("  {} {}", "Local fallback:".dimmed(), config.remote_fallback);
    }
    println!("  {} {}", "Workers:".dimmed(), config.concurrency);
    println!("  {} {}", "Max attempts:".dimmed(), config.max_attempts);
    println!("  {} {}", "Backoff:".dimmed(), describe_backoff(&config.backoff));
    println!("  {} {}", "Retry permanent failures:".dimmed(), config.retry_permanent);
    println!("  {} {:?}", "Poll timeout:".dimmed(), config.poll_timeout);
    println!("  {} {:?}", "Visibility timeout:".dimmed(), config.visibility_timeout);
    println!("  {} {:?}", "Finished job TTL:".dimmed(), config.terminal_ttl);
    println!();

    Ok(())
}

fn describe_backoff(backoff: &BackoffStrategy) -> String {
    match backoff {
        BackoffStrategy::Constant { delay_ms } => format!("constant {}ms", delay_ms),
        BackoffStrategy::Exponential {
            initial_ms,
            multiplier,
            max_ms,
        } => format!("exponential {}ms x{} (max {}ms)", initial_ms, multiplier, max_ms),
    }
}

/// Hide credentials in a connection URL
fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    match rest.rfind('@') {
        Some(at) => format!("{}://***@{}", &url[..scheme_end], &rest[at + 1..]),
        None => url.to_string(),
    }
}
