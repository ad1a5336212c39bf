//! Periodic sweeper for expired work-queue leases.
//!
//! Emits one sorted-key JSON line per sweep and a completion line on
//! stdout, for consumption by operational tooling. Diagnostics go to
//! stderr via tracing.

use anyhow::Result;
use clap::Parser;
use pipeline_core::queue::run_sweeper;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sweeper")]
#[command(about = "Periodic sweeper for expired work queue leases")]
struct Cli {
    /// Path to the SQLite database file
    #[arg(long)]
    db_path: String,

    /// Seconds to sleep between sweeps
    #[arg(long, default_value_t = 5.0)]
    interval_seconds: f64,

    /// Run a fixed number of iterations (default: run forever)
    #[arg(long)]
    iterations: Option<u64>,
}

#[derive(Serialize)]
struct CompletionEvent {
    code: &'static str,
    iterations: u64,
    total_requeued: u64,
}

/// Serialize through `Value` so object keys come out sorted.
fn emit_json<T: Serialize>(event: &T) {
    if let Ok(value) = serde_json::to_value(event) {
        if let Ok(line) = serde_json::to_string(&value) {
            println!("{line}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let report = run_sweeper(
        &cli.db_path,
        cli.interval_seconds,
        cli.iterations,
        |event| emit_json(event),
    )
    .await?;

    emit_json(&CompletionEvent {
        code: "work_queue_sweeper_complete",
        iterations: report.iterations,
        total_requeued: report.total_requeued,
    });

    Ok(())
}
