mod config;
mod db;
mod dedup;
mod engine;
mod enrich;
mod geofence;
mod matcher;
mod models;
mod notify;
mod pricing;
mod scrape;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use db::{Database, NewSearch};
use engine::{Engine, RunOptions};
use geofence::{CachedGeocoder, NominatimGeocoder};
use models::{PricePolicy, Search, SearchRow, SearchStatus};
use notify::TelegramDispatcher;
use scrape::HttpPageFetcher;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kleinalert")]
#[command(about = "Classified-ad alerts - scrape searches, track prices, notify on deals")]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter for stderr diagnostics (e.g. info, kleinalert=debug)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run all searches once
    Start {
        /// Do not send any messages
        #[arg(short, long)]
        silent: bool,

        /// Do not write to the database
        #[arg(short, long)]
        nonperm: bool,

        /// Only run the search with this ID
        #[arg(short, long)]
        exclusive: Option<i64>,

        /// Number of result pages per search
        #[arg(short, long, default_value = "1")]
        depth: u32,

        /// Also report offers, bargains and near-range prices
        #[arg(short, long)]
        verbose: bool,
    },

    /// Manage searches
    Search {
        #[command(subcommand)]
        command: SearchCommands,
    },
}

#[derive(Subcommand)]
enum SearchCommands {
    /// List all searches
    List,

    /// Add a search
    Add {
        /// Marketplace (KLEIN or EBAY)
        #[arg(short, long, default_value = "KLEIN")]
        marketplace: String,

        /// URL path; KLEIN paths contain {PAGENSEARCH}
        #[arg(short, long)]
        url: String,

        /// Search terms, exclusions prefixed with '-'
        #[arg(short, long, default_value = "")]
        filter: String,

        /// Lower bound of a price range
        #[arg(long)]
        low: Option<i64>,

        /// Upper bound of a price range
        #[arg(long)]
        high: Option<i64>,

        /// Resale target price
        #[arg(long)]
        target: Option<i64>,

        /// Additional targets, "label:price-label:price"
        #[arg(long)]
        price_info: Option<String>,

        /// Distance groups, "dist,zip,zip-dist,zip"
        #[arg(long)]
        zipcodes: Option<String>,

        /// Chat to notify instead of the default one
        #[arg(long)]
        chat_id: Option<String>,

        /// 0 = disabled, 1 = active, 2 = silent
        #[arg(short, long, default_value = "1")]
        status: i64,
    },

    /// Show one search
    Show {
        /// Search ID
        id: i64,
    },

    /// Set the status of a search (0 = disabled, 1 = active, 2 = silent)
    Status {
        /// Search ID
        id: i64,

        /// New status code
        status: i64,
    },

    /// Remove a search
    Remove {
        /// Search ID
        id: i64,
    },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = Config::load(cli.config.as_deref())?;
    let db = Database::open(config.database.path.as_deref())?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Start {
            silent,
            nonperm,
            exclusive,
            depth,
            verbose,
        } => {
            db.ensure_initialized()?;
            let options = RunOptions {
                write_database: !nonperm,
                send_messages: !silent,
                exclusive,
                depth,
                verbose,
            };
            start(&db, &config, options)?;
        }

        Commands::Search { command } => {
            db.ensure_initialized()?;
            match command {
                SearchCommands::List => list_searches(&db)?,

                SearchCommands::Add {
                    marketplace,
                    url,
                    filter,
                    low,
                    high,
                    target,
                    price_info,
                    zipcodes,
                    chat_id,
                    status,
                } => {
                    let new_search = NewSearch {
                        marketplace: marketplace.to_uppercase(),
                        url,
                        search_string: filter,
                        status,
                        price_low: low,
                        price_high: high,
                        price_target: target,
                        price_info,
                        zipcodes,
                        chat_id,
                    };
                    validate(&new_search)?;
                    let id = db.add_search(&new_search)?;
                    println!("Added search #{}", id);
                }

                SearchCommands::Show { id } => match db.get_search(id)? {
                    Some(search) => {
                        println!("Search #{}", search.id);
                        println!("Type: {}", search.marketplace);
                        println!("Status: {}", search.status);
                        println!("URL: {}", search.url);
                        println!("Filter: {}", search.search_string);
                        println!("Mode: {}", search.policy);
                        if let PricePolicy::Target { price_info, .. } = &search.policy {
                            for entry in price_info {
                                println!("  {}: {}€", entry.label, entry.target);
                            }
                        }
                        if let Some(groups) = &search.zipcodes {
                            for group in groups {
                                println!("Area: {} km around {}", group.max_distance_km, group.zipcodes.join(", "));
                            }
                        }
                        if let Some(chat_id) = &search.chat_id {
                            println!("Chat: {}", chat_id);
                        }
                    }
                    None => println!("Search #{} not found.", id),
                },

                SearchCommands::Status { id, status } => {
                    let status = SearchStatus::from_code(status)?;
                    db.set_search_status(id, status)?;
                    println!("Search #{} is now {}.", id, status);
                }

                SearchCommands::Remove { id } => {
                    if db.remove_search(id)? {
                        println!("Removed search #{}.", id);
                    } else {
                        println!("Search #{} not found.", id);
                    }
                }
            }
        }
    }

    Ok(())
}

fn start(db: &Database, config: &Config, options: RunOptions) -> Result<()> {
    let started = chrono::Local::now();
    println!("{}", "-".repeat(82));
    println!(">> Starting kleinalert @ {}", started.format("%H:%M:%S"));
    if !options.send_messages {
        println!(">> No notifications.");
    }
    if !options.write_database {
        println!(">> No changes to database.");
    }
    if options.depth > 1 {
        println!(">> Checking up to {} pages per search.", options.depth);
    }
    if let Some(id) = options.exclusive {
        println!(">> Checking only ID: {}", id);
    }

    let fetcher = HttpPageFetcher::new(&config.scrape)?;
    let geocoder = CachedGeocoder::new(NominatimGeocoder::new(&config.geocoder)?);
    let dispatcher = TelegramDispatcher::new(&config.telegram)?;
    let engine = Engine::new(db, &fetcher, &geocoder, &dispatcher, config, options)?;

    let stats = engine.run().context("Run aborted")?;

    let finished = chrono::Local::now();
    let duration = (finished - started).num_milliseconds() as f64 / 1000.0;
    println!(
        "<< kleinalert finished @ {} Duration: {:.1}s",
        finished.format("%H:%M:%S"),
        duration
    );
    println!(
        "   {} searches, {} listings scraped, {} candidates, {} worth messaging, {} messages sent",
        stats.searches,
        stats.listings_scraped,
        stats.candidates,
        stats.worth_messaging,
        stats.messages_sent
    );
    if stats.skipped_searches + stats.fetch_failures + stats.store_failures + stats.dispatch_failures > 0 {
        println!(
            "   Problems: {} invalid searches, {} fetch failures, {} store failures, {} failed messages",
            stats.skipped_searches, stats.fetch_failures, stats.store_failures, stats.dispatch_failures
        );
    }
    Ok(())
}

fn list_searches(db: &Database) -> Result<()> {
    let rows = db.list_search_rows()?;
    if rows.is_empty() {
        println!("No searches found.");
        return Ok(());
    }

    println!("{:<5} {:<6} {:<9} {:<26} {:<30} {:<12}", "ID", "TYPE", "STATUS", "MODE", "FILTER", "AREA");
    println!("{}", "-".repeat(92));
    for row in rows {
        let id = row.id;
        match Search::try_from(row) {
            Ok(search) => println!(
                "{:<5} {:<6} {:<9} {:<26} {:<30} {:<12}",
                search.id,
                search.marketplace.to_string(),
                search.status.to_string(),
                truncate(&search.policy.to_string(), 26),
                truncate(&search.search_string, 30),
                if search.zipcodes.is_some() { "search" } else { "-" }
            ),
            Err(e) => println!("{:<5} invalid: {}", id, e),
        }
    }
    Ok(())
}

/// Rejects a search the run would have to skip.
fn validate(search: &NewSearch) -> Result<()> {
    let row = SearchRow {
        id: 0,
        marketplace: search.marketplace.clone(),
        url: search.url.clone(),
        search_string: search.search_string.clone(),
        status: search.status,
        price_low: search.price_low,
        price_high: search.price_high,
        price_target: search.price_target,
        price_info: search.price_info.clone(),
        zipcodes: search.zipcodes.clone(),
        chat_id: search.chat_id.clone(),
    };
    Search::try_from(row).map(|_| ())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
