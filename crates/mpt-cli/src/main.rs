use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mpt_analytics::{
    compute_metrics, get_price_history, get_recent_changes, get_top_movers, MoverMode,
    DEFAULT_MOVING_AVERAGE_WINDOW,
};
use mpt_scraper::{BrowserLauncher, StaticLauncher};
use mpt_storage::{DocumentStore, PgStore};
use mpt_sync::{
    purge_product, report_recent_markdown, reports_dir_from_env, SyncConfig, SyncPipeline,
    SyncRunSummary,
};
use mpt_web::{AppState, ScrapeCommand, WebConfig};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mpt-cli")]
#[command(about = "Menu price tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the menu page once and reconcile it into the store.
    Scrape {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
        /// Replay a saved DOM snapshot instead of launching a browser.
        #[arg(long, value_name = "FILE")]
        from_html: Option<PathBuf>,
    },
    /// Serve the dashboard; also runs the scheduler when enabled.
    Serve,
    /// Run scheduled scrapes in the foreground until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// Check that the store is reachable.
    Ping,
    /// Delete a product and its whole price history.
    Purge { name: String },
    /// Print a product's price history and metrics.
    History {
        name: String,
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Products whose price changed recently.
    Recent {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Biggest recent price moves.
    Movers {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long, default_value_t = 5)]
        top: usize,
        #[arg(long, default_value = "abs")]
        mode: MoverMode,
    },
    /// Summarize the latest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let default_level = match std::env::var("DEBUG_LOG").as_deref() {
        Ok("1") => "debug",
        _ => "info",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scrape {
        json: false,
        from_html: None,
    }) {
        Commands::Scrape { json, from_html } => {
            let (config, store) = open_store().await?;
            let launcher: Arc<dyn BrowserLauncher> = match from_html {
                Some(path) => Arc::new(
                    StaticLauncher::from_file(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                None => Arc::new(config.chromium_launcher()),
            };
            let pipeline = SyncPipeline::new(config, store, launcher)?;
            let summary = pipeline.run_once().await?;
            if json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Serve => {
            let (config, store) = open_store().await?;
            let web = WebConfig::from_env();
            let run_lock = Arc::new(Mutex::new(()));
            let launcher = Arc::new(config.chromium_launcher());
            let pipeline = Arc::new(
                SyncPipeline::new(config, store.clone(), launcher)?.with_run_lock(run_lock.clone()),
            );
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started alongside the dashboard");
            }
            let state = AppState::new(store, ScrapeCommand::current_exe()?)
                .with_scrape_timeout(web.scrape_timeout)
                .with_run_lock(run_lock);
            mpt_web::serve(state, web.port).await?;
        }
        Commands::Schedule => {
            let (config, store) = open_store().await?;
            let launcher = Arc::new(config.chromium_launcher());
            let pipeline = Arc::new(SyncPipeline::new(config, store, launcher)?);
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler is disabled; set MPT_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
        Commands::Migrate => {
            let config = load_config()?;
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to the store")?
                .migrate()
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Ping => {
            let (_, store) = open_store().await?;
            store.ping().await.context("pinging the store")?;
            println!("store reachable");
        }
        Commands::Purge { name } => {
            let (_, store) = open_store().await?;
            let outcome = purge_product(store.as_ref(), &name).await?;
            if outcome.existed {
                println!(
                    "purged {} ({} history entries removed)",
                    outcome.product_id, outcome.history_removed
                );
            } else {
                println!("no product with id {}", outcome.product_id);
            }
        }
        Commands::History { name, hours } => {
            let (_, store) = open_store().await?;
            let points = get_price_history(store.as_ref(), &name, hours, Utc::now()).await?;
            for point in &points {
                println!("{}  {:>8.2}", point.at.format("%Y-%m-%d %H:%M"), point.price);
            }
            match compute_metrics(&points, DEFAULT_MOVING_AVERAGE_WINDOW) {
                Some(m) => println!(
                    "first {:.2} last {:.2} delta {:+.2} ({:+.2}%) moving avg {:.2}",
                    m.first_price, m.last_price, m.delta_abs, m.delta_pct, m.moving_avg
                ),
                None => println!("no history for {name}"),
            }
        }
        Commands::Recent { hours, limit } => {
            let (_, store) = open_store().await?;
            let products = get_recent_changes(store.as_ref(), hours, limit, Utc::now()).await?;
            for p in &products {
                println!(
                    "{:<40} {:>8.2} -> {:>8.2}",
                    p.name, p.last_price, p.current_price
                );
            }
            println!("{} changed in the last {hours}h", products.len());
        }
        Commands::Movers { hours, top, mode } => {
            let (_, store) = open_store().await?;
            let movers = get_top_movers(store.as_ref(), hours, top, mode, Utc::now()).await?;
            for m in &movers {
                println!(
                    "{:<40} {:>+8.2}  ({:.2} -> {:.2})",
                    m.name, m.delta, m.last_price, m.current_price
                );
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &reports_dir_from_env())?);
        }
    }

    Ok(())
}

fn load_config() -> Result<SyncConfig> {
    SyncConfig::from_env().context("loading configuration")
}

/// Loads the configuration and connects the store, for commands that need one.
async fn open_store() -> Result<(SyncConfig, Arc<dyn DocumentStore>)> {
    let config = load_config()?;
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the store")?;
    Ok((config, Arc::new(store)))
}

fn print_summary(summary: &SyncRunSummary) {
    for o in &summary.outcomes {
        match o.previous_price {
            Some(prev) if o.changed => println!(
                "[{:?}] {}: {:.2} -> {:.2} ({:+.2})",
                o.kind, o.name, prev, o.current_price, o.delta
            ),
            _ => println!("[{:?}] {}: {:.2}", o.kind, o.name, o.current_price),
        }
    }
    println!(
        "run {}: new={} changed={} unchanged={} rejected={} commits={}",
        summary.run_id,
        summary.new,
        summary.changed,
        summary.unchanged,
        summary.rejected,
        summary.commit_groups
    );
    if summary.degraded_read {
        println!("warning: store read degraded, every item was written as new");
    }
    println!("reports: {}", summary.reports_dir);
}
