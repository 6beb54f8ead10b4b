//! Operations tool for the offline store of a RustCare client
//!
//! Usage:
//!   rustcare-offline [--config offline.yaml] [--json-logs] <command>
//!
//! Configuration comes from the YAML file when given, otherwise from
//! `RUSTCARE_OFFLINE_*` environment variables (a `.env` file is honoured).

use anyhow::Context;
use clap::{Parser, Subcommand};
use rustcare_offline::{
    HttpTransport, LivenessProbe, OfflineClient, OfflineConfig, ResolutionChoice, SyncOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "rustcare-offline")]
#[command(about = "Inspect and drive the offline sync store of a RustCare client")]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "RUSTCARE_OFFLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit structured JSON logs
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pending operations, last sync and cached record counts
    Status,
    /// List queued operations
    Pending,
    /// List conflicts awaiting resolution
    Conflicts,
    /// Resolve a conflict
    Resolve {
        id: Uuid,
        /// local, server or merged
        choice: ResolutionChoice,
        /// Merged value as JSON (required for `merged`)
        #[arg(long)]
        merged: Option<String>,
    },
    /// Run one sync pass against the configured server
    Sync,
    /// Reclaim free pages in the database file
    Vacuum,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rustcare_offline=info,sqlx=warn"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_timer(ChronoUtc::rfc_3339()))
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<OfflineConfig> {
    let config = match path {
        Some(path) => OfflineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => OfflineConfig::from_env().context("Failed to load configuration from environment")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_ref())?;
    let transport = Arc::new(HttpTransport::new(&config)?);
    let client = OfflineClient::open(config, transport.clone()).await?;

    let result = run(&client, &transport, cli.command).await;
    client.close().await;
    result
}

async fn run(client: &OfflineClient, transport: &HttpTransport, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            let status = client.sync_status();
            let counts = client.cached_counts().await?;
            println!("Pending operations: {}", status.pending_count);
            println!(
                "Last sync:          {}",
                status
                    .last_sync_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!("Cached records:     {} confirmed, {} local", counts.server, counts.local);
            println!("Pending conflicts:  {}", client.pending_conflicts().await?.len());
        }
        Command::Pending => {
            for op in client.pending_operations().await? {
                // Payloads may hold PHI; only their size is shown
                println!(
                    "{:>6}  {}  {:<6}  {}  attempts={}  bytes={}{}",
                    op.seq,
                    op.id,
                    op.kind.as_str(),
                    op.key,
                    op.attempt_count,
                    serde_json::to_vec(&op.payload)?.len(),
                    op.last_error
                        .map(|e| format!("  last_error={}", e))
                        .unwrap_or_default()
                );
            }
        }
        Command::Conflicts => {
            for conflict in client.pending_conflicts().await? {
                println!(
                    "{}  {}  detected={}  fields={}",
                    conflict.id,
                    conflict.key,
                    conflict.detected_at.to_rfc3339(),
                    conflict.conflicting_fields.join(",")
                );
            }
        }
        Command::Resolve { id, choice, merged } => {
            let merged = merged
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--merged is not valid JSON")?;
            let resolved = client.resolve_conflict(id, choice, merged).await?;
            println!("Conflict {} resolved as {}", resolved.id, resolved.resolution.as_str());
        }
        Command::Sync => {
            if !transport.probe().await {
                client.set_link_state(false);
            }
            match client.sync_now().await? {
                SyncOutcome::Completed(report) => println!(
                    "Sync finished: pushed={} conflicts={} held={} failed={}",
                    report.pushed, report.conflicts, report.held, report.failed
                ),
                SyncOutcome::Offline => println!("Server unreachable; nothing sent"),
                other => println!("Sync not started: {:?}", other),
            }
        }
        Command::Vacuum => {
            client.vacuum().await?;
            println!("Vacuum complete");
        }
    }

    Ok(())
}
