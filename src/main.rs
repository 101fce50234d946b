mod config;
mod migrator;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::models::group_containers;
use crate::pipeline::Pipeline;
use crate::storage::{Repository, SearchField, SearchMode, SearchQuery};

#[derive(Parser)]
#[command(name = "agrochem-harvester", about = "SENASA agrochemical catalog harvester", version)]
struct Cli {
    /// Defaults to `harvest`
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest the full catalog into the store (default)
    Harvest,

    /// Move legacy `detail.containers` to the top-level `containers` field
    MigrateContainers,

    /// Case-insensitive search over stored products
    Search {
        term: String,

        /// Restrict to these fields (repeatable); all by default
        #[arg(short, long, value_enum)]
        field: Vec<SearchField>,

        #[arg(short, long, value_enum, default_value_t = SearchMode::Contains)]
        mode: SearchMode,

        #[arg(short, long, default_value_t = SearchQuery::DEFAULT_LIMIT)]
        limit: usize,

        /// Print matches as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print one stored product with grouped containers
    Show { id: i64 },

    /// Show database statistics
    Stats,

    /// Apply schema migrations without harvesting
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "agrochem_harvester=info,warn",
        1 => "agrochem_harvester=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let mut config = AppConfig::load()?;

    match cli.command.unwrap_or(Command::Harvest) {
        Command::Harvest => {
            let timer = utils::Timer::start("harvest");
            if cli.verbose > 0 {
                config.pipeline.progress_bar = false;
            }
            let summary = Pipeline::new(config).run().await?;
            info!(
                total_processed = summary.total_processed,
                inserted = summary.inserted,
                updated = summary.updated,
                "Manual harvest complete"
            );
            println!(
                "Harvested {} products in {:.1?}: {} new, {} updated, {} unchanged, {} partial, {} skipped",
                utils::fmt_number(summary.total_processed),
                timer.elapsed(),
                utils::fmt_number(summary.inserted),
                utils::fmt_number(summary.updated),
                utils::fmt_number(summary.unchanged),
                utils::fmt_number(summary.detail_failures),
                utils::fmt_number(summary.skipped),
            );
            if let Some(reason) = summary.stop_reason {
                println!("Stopped: {:?}", reason);
            }
        }

        Command::MigrateContainers => {
            let _t = utils::Timer::start("container-migration");
            let repo = open_repo(&config)?;
            let report = migrator::migrate_containers(&repo)?;
            println!(
                "Migrated {} of {} legacy records ({} errors)",
                report.migrated, report.scanned, report.errors
            );
        }

        Command::Search { term, field, mode, limit, json } => {
            let repo = open_repo(&config)?;
            let mut query = SearchQuery::new(term).mode(mode).limit(limit);
            if !field.is_empty() {
                query = query.fields(&field);
            }
            let hits = repo.search(&query)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else if hits.is_empty() {
                println!("No matches.");
            } else {
                for r in &hits {
                    println!(
                        "{:>8}  {:<10} {:<30} {:<30} {}",
                        r.id,
                        r.registration_number.as_deref().unwrap_or("—"),
                        r.brand.as_deref().unwrap_or("—"),
                        r.firm.as_deref().unwrap_or("—"),
                        if r.detail_fetch_failed { "(partial)" } else { "" },
                    );
                }
            }
        }

        Command::Show { id } => {
            let repo = open_repo(&config)?;
            let Some(r) = repo.get_record(id)? else {
                anyhow::bail!("No product with id {}", id);
            };
            println!("{} — {}", r.id, r.brand.as_deref().unwrap_or("—"));
            println!("  Inscripción : {}", r.registration_number.as_deref().unwrap_or("—"));
            println!("  Firma       : {}", r.firm.as_deref().unwrap_or("—"));
            println!("  Clase tox.  : {}", r.toxicological_class.as_deref().unwrap_or("—"));
            println!("  Sustancias  : {}", r.active_substances.as_deref().unwrap_or("—"));
            match &r.detail {
                Some(d) => {
                    println!("  País        : {}", d.country.as_deref().unwrap_or("—"));
                    println!("  Estado      : {}", d.product_state.as_deref().unwrap_or("—"));
                    println!("  Inscripto   : {}", d.registration_date.as_deref().unwrap_or("—"));
                    if let Some(reason) = d.withdrawal_reason.as_deref() {
                        println!("  Baja        : {}", reason);
                    }
                }
                None if r.detail_fetch_failed => println!("  (detail unavailable: fetch failed)"),
                None => {}
            }
            for group in group_containers(&r.containers) {
                println!("  {}", group.label());
                for sub in &group.variants {
                    let inactive = if sub.any_active { "" } else { " (inactivo)" };
                    println!("    {} ×{}{}", sub.label(), sub.count, inactive);
                }
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let total = repo.record_count()?;
            let partial = repo.partial_count()?;
            let last = repo.last_scrape_run()?;
            println!("─────────────────────────────────");
            println!("  Catalog — Database Stats");
            println!("─────────────────────────────────");
            println!("  Products : {}", utils::fmt_number(total));
            println!("  Partial  : {}", utils::fmt_number(partial));
            match last {
                Some(run) => {
                    println!("  Last run : {} ({})", run.started_at, run.status);
                    println!(
                        "             {} processed, {} new, {} updated",
                        utils::fmt_number(run.total_processed),
                        utils::fmt_number(run.inserted),
                        utils::fmt_number(run.updated),
                    );
                    println!("             {} partial", utils::fmt_number(run.detail_failures));
                    if let Some(err) = run.error_msg.as_deref() {
                        println!("  Error    : {}", err);
                    }
                }
                None => println!("  Last run : —"),
            }
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            open_repo(&config)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let path = config
        .storage
        .db_path
        .as_ref()
        .context("storage.db_path is not configured")?;
    Repository::open(path)
}
