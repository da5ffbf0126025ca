//! marketcrawl - VS Code Marketplace crawler

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use marketcrawl_common::logging::{init_logging, LogConfig, LogLevel};
use marketcrawl_ingest::cursor::ResumeCursor;
use marketcrawl_ingest::ingest::ExtensionStore;
use marketcrawl_ingest::{MarketplaceClient, MarketplaceConfig, Pipeline, SinkConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "marketcrawl")]
#[command(author, version, about = "VS Code Marketplace crawler")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the marketplace into the CSV and SQLite sinks
    Crawl(CrawlArgs),

    /// Show the resumption cursor and stored row count
    Status(SinkArgs),
}

#[derive(Args, Debug)]
struct CrawlArgs {
    /// Maximum number of pages to walk
    #[arg(long)]
    max_pages: Option<u32>,

    /// Extensions requested per page
    #[arg(long)]
    page_size: Option<u32>,

    /// Retries per page and per batch after the first attempt
    #[arg(long)]
    max_retries: Option<u32>,

    /// Marketplace query endpoint
    #[arg(long)]
    url: Option<String>,

    /// Directory receiving one raw JSON file per page
    #[arg(long)]
    raw_dir: Option<PathBuf>,

    /// Ignore and clear the stored cursor
    #[arg(long)]
    fresh: bool,

    #[command(flatten)]
    sinks: SinkArgs,
}

#[derive(Args, Debug)]
struct SinkArgs {
    /// CSV output file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// SQLite database URL, e.g. sqlite:vscode_extensions.db
    #[arg(long)]
    database: Option<String>,

    /// Resumption cursor file
    #[arg(long)]
    cursor: Option<PathBuf>,
}

impl SinkArgs {
    fn apply(self, mut config: SinkConfig) -> SinkConfig {
        if let Some(csv) = self.csv {
            config.csv_path = csv;
        }
        if let Some(database) = self.database {
            config.database_url = database;
        }
        if let Some(cursor) = self.cursor {
            config.cursor_path = cursor;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("marketcrawl")
        .build()
        .with_env_overrides()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Crawl(args) => crawl(args).await,
        Command::Status(args) => status(args).await,
    }
}

async fn crawl(args: CrawlArgs) -> Result<()> {
    let mut marketplace = MarketplaceConfig::from_env();
    if let Some(url) = args.url {
        marketplace.url = url;
    }
    if let Some(page_size) = args.page_size {
        marketplace.page_size = page_size;
    }
    if let Some(max_pages) = args.max_pages {
        marketplace.max_pages = max_pages;
    }

    let mut sinks = args.sinks.apply(SinkConfig::from_env());
    if let Some(raw_dir) = args.raw_dir {
        sinks.raw_dir = Some(raw_dir);
    }
    if let Some(retries) = args.max_retries {
        marketplace.max_retries = retries;
        sinks.max_retries = retries;
    }

    let max_pages = marketplace.max_pages;
    info!(
        url = %marketplace.url,
        page_size = marketplace.page_size,
        max_pages,
        csv = %sinks.csv_path.display(),
        database = %sinks.database_url,
        "Starting crawl"
    );

    let client = MarketplaceClient::new(&marketplace)?;
    let pipeline = Pipeline::open(client, marketplace, &sinks)
        .await?
        .fresh(args.fresh)
        .with_progress();

    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping before the next page");
            token.cancel();
        }
    });

    match pipeline.run(max_pages).await {
        Ok(summary) => {
            println!(
                "Committed {} page(s), {} row(s) written, {} record(s) skipped, {} distinct extension(s)",
                summary.pages_committed,
                summary.rows_written,
                summary.skipped,
                summary.distinct_records
            );
            if summary.exhausted {
                println!("Marketplace exhausted; next run starts a fresh snapshot");
            } else if let Some(page) = summary.last_committed {
                println!("Stopped after page {}; next run resumes at page {}", page, page.saturating_add(1));
            }
            Ok(())
        },
        Err(err) => {
            error!(error = %err, last_committed = ?err.last_committed(), "Crawl failed");
            Err(err.into())
        },
    }
}

async fn status(args: SinkArgs) -> Result<()> {
    let sinks = args.apply(SinkConfig::from_env());

    match ResumeCursor::new(&sinks.cursor_path).load()? {
        Some(state) => println!(
            "Last committed page: {} (at {})",
            state.last_committed_page, state.updated_at
        ),
        None => println!("No crawl in progress"),
    }

    let store = ExtensionStore::connect(&sinks.database_url, sinks.write_timeout()).await?;
    println!("Stored extensions: {}", store.count().await?);
    store.close().await;

    Ok(())
}
