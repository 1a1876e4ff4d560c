use std::path::PathBuf;

use anyhow::{Context, Result};
use bidwatch_adapters::{ListingExtractor, ListingSelectors};
use bidwatch_core::SearchCriteria;
use bidwatch_sync::{
    build_poller, load_watch_plan, parse_watch_file, RuntimeConfig, SearchStatus,
};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "bidwatch")]
#[command(about = "Watches marketplace searches and reports new matching listings")]
struct Cli {
    /// Watch file (JSON or YAML). Overrides BIDWATCH_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory receiving findings.json and logs/. Overrides BIDWATCH_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Serve search pages from `<DIR>/<query-slug>.html` instead of the network.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    /// Treat listings already in findings.json as seen.
    #[arg(long, global = true)]
    reseed: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every search until interrupted.
    Watch,
    /// Run a single polling cycle.
    Once,
    /// Validate the watch file.
    Check,
    /// Print the listings found in a saved search page.
    Extract { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bidwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut runtime = RuntimeConfig::from_env();
    if let Some(config) = cli.config {
        runtime.config_path = config;
    }
    if let Some(data_dir) = cli.data_dir {
        runtime.data_dir = data_dir;
    }
    if cli.fixtures.is_some() {
        runtime.fixtures_dir = cli.fixtures;
    }
    runtime.reseed |= cli.reseed;

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => {
            let plan = load_watch_plan(&runtime.config_path)?;
            let mut poller = build_poller(&runtime, plan).await?;

            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, stopping after the current search");
                    let _ = stop_tx.send(true);
                }
            });
            poller.run_until(stop_rx).await;
        }
        Commands::Once => {
            let plan = load_watch_plan(&runtime.config_path)?;
            let mut poller = build_poller(&runtime, plan).await?;
            let summary = poller.run_cycle().await;
            for outcome in &summary.searches {
                match &outcome.status {
                    SearchStatus::Completed {
                        extracted,
                        matched,
                        new_items,
                    } => println!(
                        "{}: extracted={} matched={} new={}",
                        outcome.query,
                        extracted,
                        matched,
                        new_items.len()
                    ),
                    SearchStatus::Skipped { reason } => {
                        println!("{}: skipped ({reason})", outcome.query)
                    }
                }
            }
            println!(
                "cycle complete: searches={} new_items={} skipped={}",
                summary.searches.len(),
                summary.new_item_count(),
                summary.skipped_count()
            );
        }
        Commands::Check => {
            let plan = load_watch_plan(&runtime.config_path)?;
            println!(
                "{}: {} searches, interval {}s",
                runtime.config_path.display(),
                plan.searches.len(),
                plan.interval.as_secs()
            );
            for search in &plan.searches {
                println!("  {}: {}", search.query, describe(&search.criteria));
            }
        }
        Commands::Extract { file } => {
            let html = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let extractor = ListingExtractor::new(&configured_selectors(&runtime)?)?;
            for listing in extractor.extract(&html)? {
                println!("{}", serde_json::to_string(&listing)?);
            }
        }
    }

    Ok(())
}

/// Selectors from the watch file when it exists, the storefront defaults otherwise.
fn configured_selectors(runtime: &RuntimeConfig) -> Result<ListingSelectors> {
    if !runtime.config_path.exists() {
        return Ok(ListingSelectors::default());
    }
    let text = std::fs::read_to_string(&runtime.config_path)
        .with_context(|| format!("reading {}", runtime.config_path.display()))?;
    let file = parse_watch_file(&runtime.config_path, &text)?;
    Ok(file.selectors.unwrap_or_default())
}

fn describe(criteria: &SearchCriteria) -> String {
    let bound = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    let mut text = format!(
        "type={} price=[{}, {}] watchers=[{}, {}]",
        criteria.listing_type,
        bound(criteria.min_price.map(|p| format!("{p:.2}"))),
        bound(criteria.max_price.map(|p| format!("{p:.2}"))),
        bound(criteria.min_watchers.map(|w| w.to_string())),
        bound(criteria.max_watchers.map(|w| w.to_string())),
    );
    if let Some(limit) = &criteria.max_time_left {
        text.push_str(&format!(" max_time_left={limit}"));
    }
    text
}
