mod config;
mod db;
mod error;
mod fetchers;
mod models;
mod pipeline;
mod prefilter;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use config::Settings;
use db::{Database, ResetScope};
use error::PipelineError;
use fetchers::{FetchOptions, FetcherRegistry, MockFetcher, SeekFetcher};
use models::{format_money, ListingKey, ListingStatus, StoredListing};
use pipeline::{FetchStats, FilterStats, Pipeline};
use prefilter::FilterConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dealscout")]
#[command(about = "Business-for-sale listing ingestion and prefiltering")]
struct Cli {
    /// Path to a TOML config file (defaults to ./dealscout.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Fetch listings from a source into the database
    Fetch {
        /// Source name, or "all" for every registered source
        #[arg(short, long, default_value = "seekbusiness")]
        source: String,

        /// Maximum listings to fetch per source
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,

        #[command(flatten)]
        search: SearchArgs,
    },

    /// Run the prefilter over listings in 'new'
    Filter {
        #[command(flatten)]
        thresholds: ThresholdArgs,
    },

    /// Return classified listings to 'new'
    Reset {
        /// Only reset listings in this status
        #[arg(long)]
        status: Option<String>,

        /// Only reset listings from this source
        #[arg(long)]
        source: Option<String>,
    },

    /// List stored listings
    List {
        /// Filter by status (new, prefilter_pass, prefilter_fail, researching, completed, all)
        #[arg(short, long, default_value = "prefilter_pass")]
        status: String,

        /// Number of listings to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show listing details
    Show {
        /// Source name, e.g. seekbusiness
        source_name: String,

        /// Listing id within that source
        source_id: String,
    },

    /// Show listing counts by status
    Stats,

    /// List registered sources
    Sources {
        /// Probe each source for reachability
        #[arg(long)]
        check: bool,
    },

    /// Fetch, reset prior classifications and filter everything again
    Daily {
        #[arg(short, long, default_value = "seekbusiness")]
        source: String,

        #[arg(short = 'n', long, default_value = "20")]
        count: usize,

        #[command(flatten)]
        search: SearchArgs,

        #[command(flatten)]
        thresholds: ThresholdArgs,
    },
}

#[derive(clap::Args)]
struct SearchArgs {
    /// Location slug, e.g. sunshine-coast-qld
    #[arg(long)]
    location: Option<String>,

    /// Search radius in kilometers
    #[arg(long)]
    radius: Option<u32>,

    /// Skip detail pages (faster, no descriptions)
    #[arg(long)]
    no_details: bool,
}

impl SearchArgs {
    fn options(&self) -> FetchOptions {
        FetchOptions {
            location: self.location.clone(),
            radius_km: self.radius,
            fetch_details: !self.no_details,
            ..FetchOptions::default()
        }
    }
}

#[derive(clap::Args)]
struct ThresholdArgs {
    /// Maximum asking price
    #[arg(long)]
    max_price: Option<i64>,

    /// Minimum annual revenue
    #[arg(long)]
    min_revenue: Option<i64>,

    /// Minimum EBITDA margin as a fraction, e.g. 0.15
    #[arg(long)]
    min_margin: Option<f64>,

    /// Maximum days on market
    #[arg(long)]
    max_days: Option<i64>,
}

impl ThresholdArgs {
    /// Flags override the configured thresholds; exclusion lists come from config only.
    fn apply(&self, base: &FilterConfig) -> Result<FilterConfig> {
        let mut config = base.clone();
        if let Some(price) = self.max_price {
            config.max_price = Some(price);
        }
        if let Some(revenue) = self.min_revenue {
            config.min_revenue = Some(revenue);
        }
        if let Some(margin) = self.min_margin {
            if !(0.0..=1.0).contains(&margin) {
                return Err(anyhow!("--min-margin must be between 0 and 1, got {}", margin));
            }
            config.min_ebitda_margin = Some(margin);
        }
        if let Some(days) = self.max_days {
            config.max_days_listed = Some(days);
        }
        Ok(config)
    }
}

fn build_registry(settings: &Settings) -> Result<FetcherRegistry> {
    let mut registry = FetcherRegistry::new();
    registry.register(Box::new(
        SeekFetcher::new(settings.seek.clone()).context("Failed to build SEEK client")?,
    ));
    registry.register(Box::new(MockFetcher::new(settings.mock.seed)));
    Ok(registry)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load config")?;
    settings.logging.init();

    let registry = build_registry(&settings)?;
    let db_path = settings.database_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Fetch {
            source,
            count,
            search,
        } => {
            db.ensure_initialized()?;
            let pipeline = Pipeline::new(&db, &registry);
            match pipeline.run_fetch(&source, count, &search.options()) {
                Ok(stats) => print_fetch_stats(&stats),
                Err(PipelineError::FetchAborted { error, partial }) => {
                    tracing::error!(source = %error.source_name, "fetch aborted");
                    print_fetch_stats(&partial);
                    return Err(anyhow!(error).context(format!("Fetch from '{}' aborted", source)));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Filter { thresholds } => {
            db.ensure_initialized()?;
            let config = thresholds.apply(&settings.filter)?;
            let stats = Pipeline::new(&db, &registry).run_filter(&config)?;
            print_filter_stats(&stats);
        }

        Commands::Reset { status, source } => {
            db.ensure_initialized()?;
            let status = status.as_deref().map(parse_status).transpose()?;
            let count = db.reset_status(&ResetScope {
                status,
                source_name: source,
            })?;
            println!("Reset {} listings to new.", count);
        }

        Commands::List { status, limit } => {
            db.ensure_initialized()?;
            let status = match status.as_str() {
                "all" => None,
                s => Some(parse_status(s)?),
            };
            let listings = db.list(status, Some(limit))?;
            if listings.is_empty() {
                println!("No listings found.");
            } else {
                print_listing_table(&listings);
            }
        }

        Commands::Show {
            source_name,
            source_id,
        } => {
            db.ensure_initialized()?;
            let key = ListingKey::new(source_id, source_name);
            match db.get(&key)? {
                Some(stored) => print_listing(&stored)?,
                None => println!("Listing {} not found.", key),
            }
        }

        Commands::Stats => {
            db.ensure_initialized()?;
            let stats = db.stats()?;
            println!("{:<16} {:>8}", "STATUS", "COUNT");
            println!("{}", "-".repeat(25));
            for status in ListingStatus::ALL {
                println!("{:<16} {:>8}", status, stats.count(status));
            }
            println!("{}", "-".repeat(25));
            println!("{:<16} {:>8}", "total", stats.total);
        }

        Commands::Sources { check } => {
            for name in registry.sources() {
                if check {
                    let healthy = registry.get(name).map(|f| f.health_check()).unwrap_or(false);
                    println!("{:<16} {}", name, if healthy { "ok" } else { "unreachable" });
                } else {
                    println!("{}", name);
                }
            }
        }

        Commands::Daily {
            source,
            count,
            search,
            thresholds,
        } => {
            db.ensure_initialized()?;
            let config = thresholds.apply(&settings.filter)?;
            let started = chrono::Local::now();
            println!("Daily run started {}", started.format("%Y-%m-%d %H:%M:%S"));

            let stats = Pipeline::new(&db, &registry)
                .run_daily(&source, count, &search.options(), &config)
                .inspect_err(|e| tracing::error!(error = %e, "daily run aborted"))?;

            print_fetch_stats(&stats.fetch);
            println!("Reset {} previously classified listings.", stats.reset);
            print_filter_stats(&stats.filter);

            let finished = chrono::Local::now();
            println!(
                "\nFinished {} ({}s)",
                finished.format("%Y-%m-%d %H:%M:%S"),
                (finished - started).num_seconds()
            );
        }
    }

    Ok(())
}

fn parse_status(s: &str) -> Result<ListingStatus> {
    s.parse::<ListingStatus>().map_err(|e| anyhow!(e))
}

fn print_fetch_stats(stats: &FetchStats) {
    println!("\nFetch results:");
    println!("  Fetched:    {}", stats.fetched);
    println!("  Inserted:   {}", stats.inserted);
    println!("  Duplicates: {}", stats.duplicates);
    println!("  Invalid:    {}", stats.errors);
    if !stats.failed_sources.is_empty() {
        println!("  Failed:     {}", stats.failed_sources.join(", "));
    }
}

fn print_filter_stats(stats: &FilterStats) {
    println!("\nFilter results:");
    println!("  Evaluated: {}", stats.evaluated);
    println!("  Passed:    {}", stats.passed);
    println!("  Failed:    {}", stats.failed);
}

fn print_listing_table(listings: &[StoredListing]) {
    println!(
        "{:<14} {:<16} {:<36} {:>12} {:>12} {:>6}",
        "SOURCE", "ID", "TITLE", "PRICE", "REVENUE", "DAYS"
    );
    println!("{}", "-".repeat(101));
    for stored in listings {
        let listing = &stored.listing;
        println!(
            "{:<14} {:<16} {:<36} {:>12} {:>12} {:>6}",
            truncate(&listing.key.source_name, 14),
            truncate(&listing.key.source_id, 16),
            truncate(&listing.title, 34),
            money_or_dash(listing.price),
            money_or_dash(listing.revenue),
            listing
                .days_listed
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

fn print_listing(stored: &StoredListing) -> Result<()> {
    let listing = &stored.listing;
    println!("{}", listing.title);
    println!("Source: {} ({})", listing.key.source_name, listing.key.source_id);
    println!("Status: {}", stored.status);
    if let Some(url) = &listing.url {
        println!("URL: {}", url);
    }
    if let Some(location) = &listing.location {
        println!("Location: {}", location);
    }
    if let Some(industry) = &listing.industry {
        println!("Industry: {}", industry);
    }

    println!("\nPrice:   {}", money_or_dash(listing.price));
    println!("Revenue: {}", money_or_dash(listing.revenue));
    println!("EBITDA:  {}", money_or_dash(listing.ebitda));
    let metrics = listing.derived_metrics();
    if let Some(margin) = metrics.ebitda_margin {
        println!("Margin:  {:.1}%", margin * 100.0);
    }
    if let Some(multiple) = metrics.asking_multiple {
        println!("Multiple: {:.2}x", multiple);
    }
    if let Some(days) = listing.days_listed {
        println!("Days listed: {}", days);
    }

    if !stored.reasons.is_empty() {
        println!("\nRejected because:");
        for reason in &stored.reasons {
            println!("  - {}", reason);
        }
    }

    println!("\nFirst seen: {}", stored.first_seen_at);
    if let Some(processed) = &stored.processed_at {
        println!("Processed: {}", processed);
    }

    if let Some(description) = &listing.description {
        println!("\n--- Description ---\n{}", textwrap::fill(description, 80));
    }
    if let Some(raw) = &listing.raw_data {
        println!(
            "\n--- Raw Data ---\n{}",
            serde_json::to_string_pretty(raw).context("Failed to render raw data")?
        );
    }
    Ok(())
}

fn money_or_dash(amount: Option<i64>) -> String {
    amount.map(format_money).unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("Bakery", 10), "Bakery");
        assert_eq!(truncate("Commercial Cleaning Run", 10), "Commerc...");
        assert_eq!(truncate("Café Noosa Heads", 7), "Café...");
    }

    #[test]
    fn test_threshold_flags_override_config() {
        let args = ThresholdArgs {
            max_price: Some(500_000),
            min_revenue: None,
            min_margin: Some(0.2),
            max_days: None,
        };
        let config = args.apply(&FilterConfig::default()).unwrap();
        assert_eq!(config.max_price, Some(500_000));
        assert_eq!(config.min_ebitda_margin, Some(0.2));
        assert_eq!(config.max_days_listed, FilterConfig::default().max_days_listed);
        assert_eq!(config.excluded_industries, FilterConfig::default().excluded_industries);

        let bad = ThresholdArgs {
            max_price: None,
            min_revenue: None,
            min_margin: Some(15.0),
            max_days: None,
        };
        assert!(bad.apply(&FilterConfig::default()).is_err());
    }

    #[test]
    fn test_search_args_to_options() {
        let args = SearchArgs {
            location: Some("noosa-qld".into()),
            radius: Some(10),
            no_details: true,
        };
        let options = args.options();
        assert_eq!(options.location.as_deref(), Some("noosa-qld"));
        assert_eq!(options.radius_km, Some(10));
        assert!(!options.fetch_details);
        assert!(options.known_ids.is_empty());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["dealscout", "fetch", "--source", "all", "-n", "5", "--no-details"]);
        match cli.command {
            Commands::Fetch { source, count, search } => {
                assert_eq!(source, "all");
                assert_eq!(count, 5);
                assert!(search.no_details);
            }
            _ => panic!("expected fetch"),
        }
    }
}
