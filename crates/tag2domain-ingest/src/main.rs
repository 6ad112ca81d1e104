//! msm2tag2domain: feed a stream of measurements into tag2domain.
//!
//! Reads measurement documents from stdin or a file and reconciles each one
//! against the open intervals in the database, one transaction per
//! measurement.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use tracing::{error, info};

use tag2domain_db::{log_pool_metrics, Database};
use tag2domain_msm::{FreshnessGuard, MeasurementToTags};

mod config;
mod logging;
mod runner;
mod source;

use config::Config;
use runner::Runner;
use source::DocumentStream;

#[derive(Parser)]
#[command(name = "msm2tag2domain")]
#[command(author, version, about = "Apply tag2domain measurements to the database")]
#[command(group(ArgGroup::new("input").required(true).args(["stdin", "file"])))]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Read measurements from stdin
    #[arg(long)]
    stdin: bool,

    /// Read measurements from a file
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Apply pending migrations before consuming
    #[arg(long)]
    migrate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(subsystem = "ingest", error = %format!("{:#}", e), "msm2tag2domain failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _log_guard = logging::init_logging(&config.logging);

    info!(
        subsystem = "ingest",
        component = "main",
        version = env!("CARGO_PKG_VERSION"),
        "Starting msm2tag2domain"
    );

    let db = Database::connect_with_config(
        config.database_url()?,
        config.database.pool.clone(),
        &config.tables(),
    )
    .await
    .context("connecting to database")?;

    if cli.migrate {
        db.migrate().await.context("applying migrations")?;
        info!(subsystem = "ingest", component = "main", "Migrations applied");
    }

    let freshness = FreshnessGuard::from_minutes(config.tag2domain.max_measurement_age_minutes)?;
    let handler = MeasurementToTags::new(db.adapter()).with_freshness(freshness);
    let mut runner = Runner::new(handler, config.retry);

    let reader: Box<dyn BufRead> = match &cli.file {
        Some(path) => Box::new(io::BufReader::new(
            std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let result = runner.run(DocumentStream::new(reader)).await;
    log_pool_metrics(db.pool());

    let summary = runner.summary();
    info!(
        subsystem = "ingest",
        component = "main",
        read = summary.read,
        handled = summary.handled,
        stale = summary.stale,
        rejected = summary.rejected,
        skipped = summary.skipped,
        retries = summary.retries,
        "Run finished"
    );

    result.context("consuming measurements")
}
