use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jac_core::{FieldValue, TrackedField};
use jac_sync::{
    build_scheduler, load_field_schema, open_store, report_runs_markdown, ConflictLedger,
    ConsolidationConfig, ConsolidationPipeline, ConsolidationStats, ReconcileOptions, Resolution,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "jac-cli")]
#[command(about = "Judicial auction consolidator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the enabled source snapshots into consolidated records.
    Consolidate {
        /// Recompute fields that were already resolved by hand.
        #[arg(long)]
        force_reevaluate: bool,
    },
    /// Records with fields awaiting arbitration.
    Pending,
    Conflicts {
        record_id: Uuid,
    },
    /// Raw value each source reported for one field.
    Compare {
        record_id: Uuid,
        field: TrackedField,
    },
    Resolve {
        record_id: Uuid,
        field: TrackedField,
        value: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Stats,
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Re-consolidate on the configured cron schedule until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = ConsolidationConfig::from_env();

    match cli.command.unwrap_or(Commands::Consolidate {
        force_reevaluate: false,
    }) {
        Commands::Consolidate { force_reevaluate } => {
            let store = open_store(&config.store).await?;
            let summary = ConsolidationPipeline::new(config, store)
                .with_options(ReconcileOptions { force_reevaluate })
                .run_once()
                .await?;
            println!(
                "consolidation complete: run_id={} raw={} consolidated={} unmatched={} \
                 pending={} writes={}/{} reports={}",
                summary.run_id,
                summary.raw_records,
                summary.consolidated,
                summary.unmatched,
                summary.pending_validation,
                summary.succeeded_writes,
                summary.attempted_writes,
                summary.reports_dir
            );
        }
        Commands::Pending => {
            let store = open_store(&config.store).await?;
            for record in store.list_pending_conflicts().await? {
                let fields = record
                    .pending_validation
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "{}  {}  {}  {}  confidence={:.1}  pending={}",
                    record.id,
                    record.sale_date.map(|d| d.to_string()).unwrap_or_else(|| "----------".into()),
                    record.court.as_deref().unwrap_or("-"),
                    record.city.as_deref().unwrap_or("-"),
                    record.confidence_score,
                    fields
                );
            }
        }
        Commands::Conflicts { record_id } => {
            let ledger = ledger(&config).await?;
            let conflicts = ledger.get_unresolved_conflicts(record_id).await?;
            println!("{}", serde_json::to_string_pretty(&conflicts)?);
        }
        Commands::Compare { record_id, field } => {
            let store = open_store(&config.store).await?;
            let record = store
                .get_by_id(record_id)
                .await?
                .with_context(|| format!("unknown record {record_id}"))?;
            println!("{field} ({:?})", record.field_confidence(field));
            for (source, value) in record.field_comparison(field) {
                let shown = value.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
                println!("  {source:<20} {shown}");
            }
        }
        Commands::Resolve {
            record_id,
            field,
            value,
            source,
            reason,
        } => {
            let ledger = ledger(&config).await?;
            let record = ledger
                .resolve(
                    record_id,
                    Resolution {
                        field,
                        chosen_value: FieldValue::Text(value),
                        chosen_source: source,
                        reason,
                    },
                    Utc::now(),
                )
                .await?;
            println!(
                "resolved {field} on {}: confidence={:.1} remaining={}",
                record.id,
                record.confidence_score,
                record.pending_validation.len()
            );
        }
        Commands::Stats => {
            let store = open_store(&config.store).await?;
            let records = store.list_all(usize::MAX, 0).await?;
            let stats = ConsolidationStats::from_records(&records);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(runs, &config.reports_root())?);
        }
        Commands::Serve { bind } => {
            let store = open_store(&config.store).await?;
            let schema = load_field_schema(&config.schema_path()).await?;
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            let state = jac_web::AppState::new(store, schema.len(), config.reports_root());
            jac_web::serve(&bind, state).await?;
        }
        Commands::Watch => {
            let mut config = config;
            config.scheduler_enabled = true;
            let store = open_store(&config.store).await?;
            let pipeline = Arc::new(ConsolidationPipeline::new(config, store));
            let Some(sched) = build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!("watching for new snapshots; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}

async fn ledger(config: &ConsolidationConfig) -> Result<ConflictLedger> {
    let store = open_store(&config.store).await?;
    let schema = load_field_schema(&config.schema_path()).await?;
    Ok(ConflictLedger::new(store, schema.len()))
}
