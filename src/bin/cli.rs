//! Judgment harvester CLI
//!
//! Local execution entry point for the crawler and the indexer.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use harvester::{error::Result, models::Config, pipeline};
use tokio_util::sync::CancellationToken;

/// Harvester - Court Judgments Crawler and Indexer
#[derive(Parser, Debug)]
#[command(
    name = "harvester",
    version,
    about = "Crawls court judgments into object storage and indexes them"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk the judgments listing and store every document
    Crawl {
        /// Listing to start from (default: crawler.root_url)
        #[arg(long)]
        root_url: Option<String>,

        /// Where to write stored references (default: crawler.output_file)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Index stored documents into the vector store
    Index {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Validate configuration
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load_or_default(&cli.config);
    config.apply_env_overrides();
    log::info!("Loaded configuration from {}", cli.config.display());

    if let Err(e) = config.validate() {
        log::error!("Config validation failed: {}", e);
        return Err(e);
    }

    let cancel = CancellationToken::new();
    let listener = pipeline::spawn_signal_listener(cancel.clone());

    let result = match cli.command {
        Command::Crawl { root_url, output } => {
            let root_url = root_url.unwrap_or_else(|| config.crawler.root_url.clone());
            let output = output.unwrap_or_else(|| PathBuf::from(&config.crawler.output_file));
            pipeline::run_crawler(&config, &root_url, &output, cancel.clone())
                .await
                .map(|_| ())
        }

        Command::Index { once } => pipeline::run_indexer(&config, once, cancel.clone()).await,

        Command::Validate => {
            log::info!("✓ Config OK");
            log::info!("  root: {}", config.crawler.root_url);
            log::info!("  storage: {:?} ({})", config.storage.backend, config.storage.folder);
            log::info!("  ledger: {}", config.indexer.ledger_path);
            Ok(())
        }
    };

    cancel.cancel();
    let _ = listener.await;

    if let Err(e) = &result {
        log::error!("{}", e);
    } else {
        log::info!("Done!");
    }
    result
}
