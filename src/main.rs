//! # Catalog Harvester CLI (`harvester`)
//!
//! A thin process host: it prepares the database, runs one-off harvests,
//! prints catalog statistics and hosts the background scheduler.
//!
//! ## Usage
//!
//! ```bash
//! harvester --config ./config/harvester.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvester init` | Create the SQLite database and run schema migrations |
//! | `harvester harvest <kind> <url>` | Harvest one URL (`--force` re-harvests a completed one) |
//! | `harvester stats` | Print catalog statistics |
//! | `harvester run` | Run the scheduler until Ctrl-C |
//!
//! ## Examples
//!
//! ```bash
//! harvester init
//! harvester harvest github https://github.com/acme/weather-mcp
//! harvester harvest npm npm:@acme/mcp-files --force
//! harvester run
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use catalog_harvester::app::App;
use catalog_harvester::cache::StatsCache;
use catalog_harvester::config;
use catalog_harvester::harvest::{HarvestMode, HarvestOutcome};
use catalog_harvester::logging;
use catalog_harvester::migrate;
use catalog_harvester::models::HostType;
use catalog_harvester::stats;

/// Catalog Harvester: collect, score and risk-assess server packages.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvester.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvester",
    about = "Catalog Harvester — collect, score and risk-assess server packages",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvester.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: only migrations that have not been applied yet run.
    Init,

    /// Harvest a single source URL.
    Harvest {
        /// Source kind: `github`, `npm`, `pypi`, `docker` or `http`.
        kind: HostType,

        /// Source URL, e.g. `https://github.com/o/r` or `npm:name`.
        url: String,

        /// Re-harvest even if the checkpoint is already completed.
        #[arg(long)]
        force: bool,
    },

    /// Print catalog statistics.
    Stats,

    /// Run the background scheduler until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.level)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Harvest { kind, url, force } => {
            let app = App::open(cfg).await?;
            let mode = if force {
                HarvestMode::Force
            } else {
                HarvestMode::Normal
            };
            let outcome = app
                .harvester
                .harvest(kind, &url, mode)
                .await
                .with_context(|| format!("Harvest of {} failed", url))?;
            print_outcome(&outcome);
            app.close().await;
        }
        Commands::Stats => {
            let app = App::open(cfg).await?;
            stats::run_stats(&app.config, &app.catalog).await?;
            app.close().await;
        }
        Commands::Run => {
            if !cfg.scheduler.enabled {
                anyhow::bail!("scheduler is disabled ([scheduler].enabled = false)");
            }
            let app = App::open(cfg).await?;
            let scheduler = app.scheduler(Arc::new(StatsCache::new()))?;
            scheduler.start();
            for job in scheduler.status() {
                println!(
                    "  {:<20} next run {}",
                    job.id,
                    job.next_run_at
                        .map_or_else(|| "pending".to_string(), |t| t.to_rfc3339())
                );
            }

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            println!("Shutting down...");
            scheduler.stop().await;
            app.close().await;
        }
    }

    Ok(())
}

fn print_outcome(outcome: &HarvestOutcome) {
    let server = outcome.server();
    let verb = if outcome.is_harvested() {
        "Harvested"
    } else {
        "Already harvested (use --force to refresh)"
    };
    println!("{}: {}", verb, server.name);
    println!("  id:          {}", server.id);
    println!("  url:         {}", server.primary_url);
    println!("  health:      {}", server.health_score);
    println!("  risk:        {}", server.risk_level);
    println!("  tools:       {}", server.tools.len());
    println!("  deps:        {}", server.dependencies.len());
    println!("  contributors:{:>3}", server.contributors.len());
    println!("  bus factor:  {}", server.bus_factor());
    for finding in server.risk_findings.iter().take(10) {
        println!(
            "    {:?} {}:{} `{}`",
            finding.category, finding.file, finding.line, finding.pattern
        );
    }
}
