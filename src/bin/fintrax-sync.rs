use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fintrax_sync::{
    EntityData, EntityKind, HttpProbe, HttpTransport, OfflineSync, PassReport, StaticToken,
    SyncConfig,
};

#[derive(Parser)]
#[command(name = "fintrax-sync", about = "Offline-first sync engine for Fintrax data")]
struct Cli {
    /// Database path (default: ~/.fintrax/fintrax.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl fintrax_sync::SyncProgress for StderrProgress {
    fn on_pass_start(&self, queued: usize) {
        eprintln!("Syncing {queued} queued operations...");
    }

    fn on_batch_complete(&self, batch: u32, report: &PassReport) {
        eprintln!(
            "  Batch {batch}: {} synced, {} failed so far",
            report.synced, report.failed
        );
    }

    fn on_operation_failed(&self, op: &fintrax_sync::Operation, error: &fintrax_sync::Error) {
        eprintln!("  {} {}:{} failed: {error}", op.op_type, op.entity, op.entity_id);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue and sync status
    Status,
    /// Run one sync pass now
    Sync,
    /// Re-queue failed operations and sync
    Retry,
    /// List permanently failed operations
    Failed {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete all local records and queued operations
    Logout {
        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Create a record from a JSON payload
    Create {
        /// task, project or transaction
        kind: EntityKind,
        /// camelCase JSON payload
        json: String,
    },
    /// Apply a partial JSON update to a record
    Update {
        kind: EntityKind,
        id: String,
        json: String,
    },
    /// Delete a record
    Delete { kind: EntityKind, id: String },
    /// List records of one kind
    List {
        kind: EntityKind,
        /// Include soft-deleted records
        #[arg(long)]
        all: bool,
    },
    /// Keep syncing in the background until Ctrl-C
    Run {
        /// Seconds between connectivity probes
        #[arg(long, default_value = "15")]
        probe_every: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => fintrax_sync::Database::open_at(path).await?,
        None => fintrax_sync::Database::open().await?,
    };
    let config = SyncConfig::load(&db).await?;
    let sync = OfflineSync::connect(db, config.clone(), Arc::new(StaticToken::from_env()))?;

    match cli.command {
        Commands::Status => print_status(&sync).await?,
        Commands::Sync => {
            let report = sync.sync_all_with(&StderrProgress).await?;
            print_report(&report);
        }
        Commands::Retry => {
            let report = sync.retry_failed().await?;
            print_report(&report);
        }
        Commands::Failed { json } => {
            let failed = sync.failed_operations().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&failed)?);
            } else if failed.is_empty() {
                println!("No failed operations.");
            } else {
                for op in failed {
                    println!(
                        "{}  {} {}:{}  retries={}  {}",
                        op.id,
                        op.op_type,
                        op.entity,
                        op.entity_id,
                        op.retry_count,
                        op.error.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Logout { yes } => {
            if !yes {
                let pending = sync.pending_count().await?;
                anyhow::bail!(
                    "logout deletes all local data ({pending} operations not yet synced); re-run with --yes"
                );
            }
            sync.logout().await?;
            println!("Local data deleted.");
        }
        Commands::Config { action } => handle_config(&sync, action).await?,
        Commands::Create { kind, json } => {
            let data = EntityData::from_json(kind, serde_json::from_str(&json)?)?;
            let record = sync.create(data).await?;
            println!("{}", serde_json::to_string_pretty(&record.to_json()?)?);
        }
        Commands::Update { kind, id, json } => {
            let record = sync.update(kind, &id, serde_json::from_str(&json)?).await?;
            println!("{}", serde_json::to_string_pretty(&record.to_json()?)?);
        }
        Commands::Delete { kind, id } => {
            sync.delete(kind, &id).await?;
            println!("Deleted {kind}:{id}");
        }
        Commands::List { kind, all } => {
            let records = if all {
                sync.list_including_deleted(kind).await?
            } else {
                sync.list(kind).await?
            };
            let rows = records
                .iter()
                .map(|r| r.to_json())
                .collect::<fintrax_sync::Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Run { probe_every } => run(sync, &config, probe_every).await?,
    }

    Ok(())
}

async fn run(
    sync: OfflineSync<HttpTransport>,
    config: &SyncConfig,
    probe_every: u64,
) -> anyhow::Result<()> {
    let probe = HttpProbe::new(&config.api_base_url, Duration::from_secs(5))?;
    let prober = fintrax_sync::spawn_probe(
        sync.monitor().clone(),
        probe,
        Duration::from_secs(probe_every.max(1)),
    );
    let worker = sync.start_with(Arc::new(StderrProgress));
    eprintln!(
        "Syncing against {} every {}s. Press Ctrl-C to stop.",
        config.api_base_url,
        config.poll_interval.as_secs()
    );

    tokio::signal::ctrl_c().await?;
    prober.abort();
    worker.shutdown().await;
    eprintln!("Stopped.");
    Ok(())
}

fn print_report(report: &PassReport) {
    println!("Sync {:?}", report.status);
    println!("  Synced:    {}", report.synced);
    println!("  Failed:    {}", report.failed);
    println!("  Conflicts: {}", report.conflicts);
    println!("  Collapsed: {}", report.collapsed);
    println!("  Pending:   {}", report.remaining);
}

async fn print_status(sync: &OfflineSync<HttpTransport>) -> anyhow::Result<()> {
    let queue = sync.queue_stats().await?;
    let last_sync = sync.last_sync_time().await?;

    println!("Sync Status");
    println!("  Pending:   {}", queue.pending);
    println!("  Failed:    {}", queue.failed);
    println!("  Queued:    {}", queue.total);
    for kind in EntityKind::ALL {
        let stats = sync.entity_stats(kind).await?;
        println!(
            "  {:<12} {} total, {} pending, {} failed",
            format!("{kind}s:"),
            stats.total,
            stats.pending,
            stats.failed
        );
    }
    println!(
        "  Last sync: {}",
        last_sync
            .map(fintrax_sync::date_util::to_iso)
            .unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}

async fn handle_config(
    sync: &OfflineSync<HttpTransport>,
    action: ConfigAction,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match sync.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            sync.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = sync.config_list().await?;
            if items.is_empty() {
                println!("No config values set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}
