//! archive-dl - bulk downloader for digital-archive collections
//!
//! Reads item identifiers from the command line (or stdin), downloads every file
//! not yet recorded in the completion cache, and writes one tab-separated row per
//! finished file to stdout. Diagnostics go to stderr. Exit status: 0 when the
//! collection is complete, 1 when another run is needed, 2 on fatal errors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use archive_dl::config::cache_path_for_collection;
use archive_dl::input::read_identifiers;
use archive_dl::report::{ExitStatus, TransferLog};
use archive_dl::{CollectionDownloader, Config, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "archive-dl")]
#[command(version)]
#[command(about = "Resumable bulk downloader for digital-archive collections")]
struct Cli {
    /// Item identifiers; read one per line from stdin when none are given
    identifiers: Vec<String>,

    /// Parallel transfers (default: 4)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Destination directory; files land in <dest>/<item>/<file> (default: .)
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// Download items in random order
    #[arg(long)]
    shuffle: bool,

    /// Seed for --shuffle, for a reproducible order
    #[arg(long)]
    seed: Option<u64>,

    /// Only download files whose name matches this glob; separate alternatives with '|'
    #[arg(long)]
    filter: Option<String>,

    /// Collection name, selects the default completion cache file
    #[arg(short, long)]
    collection: Option<String>,

    /// Completion cache file (overrides --collection)
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Reuse cached item file listings instead of asking the service again
    #[arg(long)]
    cache_listings: bool,

    /// Record existing destination files as complete if their MD5 matches
    #[arg(long)]
    check_md5: bool,

    /// Stop after more than this many failures in a row; 0 never stops (default: 100)
    #[arg(long)]
    max_consecutive_failures: Option<usize>,

    /// Per-file timeout in seconds (default: 3600)
    #[arg(long)]
    timeout: Option<u64>,

    /// Maximum seconds without receiving data (default: 60)
    #[arg(long)]
    stall_timeout: Option<u64>,

    /// Service root URL (default: https://archive.org)
    #[arg(long)]
    base_url: Option<String>,

    /// Access key
    #[arg(long, env = "IA_ACCESS_KEY", hide_env_values = true)]
    access_key: Option<String>,

    /// Secret key
    #[arg(long, env = "IA_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// JSON configuration file; command line options take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Start from the config file (or defaults) and apply every option given
    fn build_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };

        let download = &mut config.download;
        if let Some(jobs) = self.jobs {
            download.jobs = jobs;
        }
        if let Some(dest) = &self.dest {
            download.dest = dest.clone();
        }
        if self.shuffle {
            download.shuffle = true;
        }
        if self.seed.is_some() {
            download.seed = self.seed;
        }
        if self.filter.is_some() {
            download.filter = self.filter.clone();
        }
        if self.check_md5 {
            download.verify_existing = true;
        }
        if let Some(max) = self.max_consecutive_failures {
            download.max_consecutive_failures = (max > 0).then_some(max);
        }

        let remote = &mut config.remote;
        if let Some(secs) = self.timeout {
            remote.file_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.stall_timeout {
            remote.stall_timeout = Duration::from_secs(secs);
        }
        if let Some(url) = &self.base_url {
            remote.base_url = url.clone();
        }
        if self.access_key.is_some() {
            remote.access_key = self.access_key.clone();
        }
        if self.secret_key.is_some() {
            remote.secret_key = self.secret_key.clone();
        }

        let persistence = &mut config.persistence;
        if let Some(cache) = &self.cache {
            persistence.cache_path = cache.clone();
        } else if let Some(collection) = &self.collection {
            persistence.cache_path = cache_path_for_collection(collection)?;
        }
        if self.cache_listings {
            persistence.cache_listings = true;
        }

        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let directive = if verbose {
        "archive_dl=debug"
    } else {
        "archive_dl=info"
    };

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = directive.parse() {
        filter = filter.add_directive(directive);
    }

    // stdout is reserved for the transfer log
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    let config = cli.build_config()?;
    let items = read_identifiers(&cli.identifiers, std::io::stdin().lock())?;

    let downloader = CollectionDownloader::new(config).await?;
    archive_dl::cancel_on_signal(downloader.cancellation_token());

    let mut log = TransferLog::new(Box::new(std::io::stdout()));
    let result = downloader.run(items, &mut log).await;
    downloader.shutdown().await;

    Ok(result?.exit_status())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(status) => status.into(),
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitStatus::Fatal.into()
        }
    }
}
