use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parl_adapters::all_profiles;
use parl_core::EntityType;
use parl_storage::{MemoryStore, RemoteStore};
use parl_sync::{ExportOptions, ExportSummary, Exporter, Stage, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parl")]
#[command(about = "Export staged parliamentary records to the remote API")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synchronize one parliament's staged records.
    Export {
        #[arg(long)]
        parliament: String,
        /// Comma-separated stages to run; all stages when omitted.
        #[arg(long, value_delimiter = ',')]
        only: Vec<Stage>,
        /// Which of the profile's chambers to attach records to.
        #[arg(long, default_value_t = 0)]
        chamber: usize,
        /// Run against an in-memory store instead of the server.
        #[arg(long)]
        dry_run: bool,
    },
    /// Count staged records per entity type.
    Stats {
        #[arg(long)]
        parliament: String,
    },
    /// List known parliament profiles.
    Parliaments,
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("installing log subscriber: {err}"))
}

fn print_summary(summary: &ExportSummary) {
    println!(
        "export complete: run_id={} parliament={} started={} finished={}",
        summary.run_id,
        summary.parliament,
        summary.started_at.to_rfc3339(),
        summary.finished_at.to_rfc3339()
    );
    for (stage, stats) in &summary.stages {
        println!(
            "{stage}: created={} updated={} skipped={} votes_submitted={} votes_withheld={}",
            stats.created, stats.updated, stats.skipped, stats.submitted, stats.withheld
        );
    }
}

async fn export(
    config: &SyncConfig,
    parliament: &str,
    options: ExportOptions,
    dry_run: bool,
) -> Result<()> {
    if !dry_run {
        let summary = parl_sync::run_export_from_env(parliament, options).await?;
        print_summary(&summary);
        return Ok(());
    }

    let profile = config.profile(parliament)?;
    let reader = config.staged_reader(profile.as_ref());
    info!(root = %reader.root().display(), "dry run against an in-memory store");
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn RemoteStore> = memory.clone();
    let summary = Exporter::new(store, reader, profile)
        .with_options(options)
        .run_export()
        .await
        .with_context(|| format!("dry-run export of {parliament}"))?;
    print_summary(&summary);
    for entity in EntityType::ALL {
        println!("would create {} {entity}", memory.len(entity));
    }
    Ok(())
}

fn stats(config: &SyncConfig, parliament: &str) -> Result<()> {
    let profile = config.profile(parliament)?;
    let reader = config.staged_reader(profile.as_ref());
    println!("{} ({})", profile.display_name(), reader.root().display());
    for entity in EntityType::ALL {
        let count = reader
            .count(entity)
            .with_context(|| format!("counting staged {entity}"))?;
        println!("{entity}: {count}");
    }
    Ok(())
}

fn parliaments(config: &SyncConfig) -> Result<()> {
    let registry = config.load_registry()?;
    for profile in all_profiles(registry.as_ref()) {
        println!(
            "{} {} domain={} endpoint={} single_chamber={}",
            profile.code,
            profile.display_name,
            profile.domain,
            profile.endpoint,
            profile.single_chamber
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Export {
            parliament,
            only,
            chamber,
            dry_run,
        } => {
            let mut options = if only.is_empty() {
                ExportOptions::default()
            } else {
                ExportOptions::only(only)
            };
            options.chamber_index = chamber;
            export(&config, &parliament, options, dry_run).await?;
        }
        Commands::Stats { parliament } => stats(&config, &parliament)?,
        Commands::Parliaments => parliaments(&config)?,
    }

    Ok(())
}
