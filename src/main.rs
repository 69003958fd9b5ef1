use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod agent;
mod analytics;
mod config;
mod db;
mod error;
mod features;
mod ingest;
mod meta;
mod models;
mod predictor;
mod report;
mod stats;
mod store;
mod tools;

use crate::agent::ResidentAgent;
use crate::config::Config;
use crate::meta::RefreshMetaCell;
use crate::models::{AreaType, RefreshMeta};
use crate::predictor::BaselinePredictor;
use crate::store::{RequestStore, SharedStore};
use crate::tools::{AgentTools, FixtureTools, LiveTools, ToolError};

#[derive(Parser)]
#[command(name = "chi311-copilot")]
#[command(about = "Resolution-time estimates, equity and hotspots for Chicago 311 requests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import service requests from an open-data CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record a data refresh and publish new refresh metadata
    Refresh,
    /// Current status of a service request
    Status { sr_number: String },
    /// Estimated time to resolution for a service request
    Eta { sr_number: String },
    /// Compare an area's median resolution time to the city
    Equity {
        area_name: String,
        #[arg(long, default_value = tools::DEFAULT_AREA_TYPE)]
        area_type: String,
        #[arg(long)]
        category: Option<String>,
    },
    /// Clusters of unresolved requests
    Hotspots {
        category: String,
        #[arg(long, default_value_t = tools::DEFAULT_HOTSPOT_DAYS)]
        days: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Data freshness and model versions
    Meta,
    /// Static liveness check
    Health,
    /// Resident-facing summary of a service request
    Summary {
        sr_number: String,
        /// Answer from a JSON fixture set instead of the database
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Generate a markdown equity and hotspot report
    Report {
        #[arg(long)]
        category: String,
        #[arg(long, default_value = tools::DEFAULT_AREA_TYPE)]
        area_type: String,
        #[arg(long, default_value_t = tools::DEFAULT_HOTSPOT_DAYS)]
        days: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = config::database_url()?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn initial_meta(pool: &PgPool, config: &Config) -> anyhow::Result<RefreshMeta> {
    if let Some(meta) = db::latest_refresh(pool).await? {
        return Ok(meta);
    }

    let data_last_updated = db::latest_import(pool)
        .await?
        .context("no service requests imported yet; run `import` first")?;
    warn!("no refresh run recorded; using latest import time");
    Ok(config.refresh_meta(data_last_updated))
}

async fn live_tools(pool: &PgPool, config: &Config) -> anyhow::Result<LiveTools> {
    let records = db::fetch_requests(pool).await?;
    let store = RequestStore::from_records(records).context("stored requests are inconsistent")?;
    info!(requests = store.len(), "loaded request store");

    let meta = RefreshMetaCell::new(initial_meta(pool, config).await?);
    Ok(LiveTools::new(
        Arc::new(SharedStore::new(store)),
        Arc::new(BaselinePredictor::new(config.model_version.clone())),
        Arc::new(config.significance),
        config.analytics.clone(),
        Arc::new(meta),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let summary = db::import_csv(&pool, &csv).await?;
            println!(
                "Wrote {} requests from {} ({} unchanged, {} skipped).",
                summary.written,
                csv.display(),
                summary.unchanged,
                summary.skipped
            );
        }
        Commands::Refresh => {
            let pool = connect().await?;
            let data_last_updated = db::latest_import(&pool)
                .await?
                .context("no service requests imported yet; run `import` first")?;
            let meta = config.refresh_meta(data_last_updated);
            let id = db::record_refresh(&pool, &meta).await?;
            info!(%id, "recorded refresh run");
            print_json(&meta)?;
        }
        Commands::Status { sr_number } => {
            let tools = live_tools(&connect().await?, &config).await?;
            print_json(&tools.get_request_status(&sr_number)?)?;
        }
        Commands::Eta { sr_number } => {
            let tools = live_tools(&connect().await?, &config).await?;
            print_json(&tools.predict_eta(&sr_number)?)?;
        }
        Commands::Equity {
            area_name,
            area_type,
            category,
        } => {
            let tools = live_tools(&connect().await?, &config).await?;
            print_json(&tools.area_equity(&area_name, &area_type, category.as_deref())?)?;
        }
        Commands::Hotspots {
            category,
            days,
            limit,
        } => {
            let tools = live_tools(&connect().await?, &config).await?;
            let hotspots = tools.hotspots(&category, days)?;
            print_json(&hotspots.into_iter().take(limit).collect::<Vec<_>>())?;
        }
        Commands::Meta => {
            let tools = live_tools(&connect().await?, &config).await?;
            print_json(&tools.refresh_meta()?)?;
        }
        Commands::Health => {
            print_json(&serde_json::json!({ "status": "ok" }))?;
        }
        Commands::Summary {
            sr_number,
            fixtures,
        } => {
            let answer = match fixtures {
                Some(path) => ResidentAgent::new(FixtureTools::load(&path)?).summarize(&sr_number),
                None => {
                    let tools = live_tools(&connect().await?, &config).await?;
                    ResidentAgent::new(tools).summarize(&sr_number)
                }
            };
            println!("{answer}");
        }
        Commands::Report {
            category,
            area_type,
            days,
            out,
        } => {
            let parsed: AreaType = area_type.parse()?;
            let tools = live_tools(&connect().await?, &config).await?;

            let mut equity = Vec::new();
            for id in 1..=parsed.max_id() {
                match tools.area_equity(&id.to_string(), &area_type, Some(&category)) {
                    Ok(result) => equity.push(result),
                    Err(ToolError::NotFound(_)) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            let hotspots: Vec<_> = tools.hotspots(&category, days)?.into_iter().take(10).collect();
            let meta = tools.refresh_meta()?;

            let report = report::build_report(&category, parsed, days, &meta, &equity, &hotspots);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
