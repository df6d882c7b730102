use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use profq_pipeline::{
    build_quality_monitor, run_full_quality_check, run_ingest_once_from_env, AppContext,
    ROWS_PROCESSED_PREFIX,
};
use profq_quality::AlertEvent;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "profq-cli")]
#[command(about = "Profile dataset ingestion and data-quality monitoring")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse the input CSV, deduplicate and publish a new dataset version.
    Ingest,
    /// Evaluate every quality rule over the current dataset and dispatch alerts.
    Quality,
    /// Run the quality check on the configured cron schedule until ctrl-c.
    Monitor,
    /// Serve the JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one message through the configured notifier.
    NotifyTest {
        #[arg(default_value = "profq notifier test")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Ingest);
    if let Commands::Ingest = command {
        // Ingest needs neither the notifier nor the rules, so it builds no context.
        return ingest().await;
    }
    let ctx = Arc::new(AppContext::from_env()?);
    let result = run(command, ctx.clone()).await;
    ctx.shutdown().await;
    result
}

async fn ingest() -> Result<()> {
    let summary = run_ingest_once_from_env().await?;
    info!(
        run_id = %summary.run_id,
        rows_read = summary.rows_read,
        ragged = summary.ragged_rows,
        shards = summary.shard_count,
        version = %summary.dataset_version,
        "ingest complete"
    );
    println!("{ROWS_PROCESSED_PREFIX} {}", summary.after_dedup);
    Ok(())
}

async fn run(command: Commands, ctx: Arc<AppContext>) -> Result<()> {
    match command {
        Commands::Ingest => ingest().await?,
        Commands::Quality => {
            let report = run_full_quality_check(&ctx);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Monitor => {
            run_full_quality_check(&ctx);
            let mut sched = build_quality_monitor(ctx.clone()).await?;
            sched.start().await.context("starting quality monitor")?;
            info!(cron = %ctx.config().quality_cron, "quality monitor running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping quality monitor")?;
        }
        Commands::Serve { port } => {
            profq_web::serve(ctx.clone(), port.unwrap_or_else(profq_web::port_from_env)).await?;
        }
        Commands::NotifyTest { message } => {
            let event = ctx
                .dispatcher()
                .dispatch_now(AlertEvent::pending("notify-test", message))
                .await;
            println!("{}", serde_json::to_string_pretty(&event)?);
            if !event.dispatched {
                anyhow::bail!("notification not delivered: {}", event.reference_or_error);
            }
        }
    }
    Ok(())
}
