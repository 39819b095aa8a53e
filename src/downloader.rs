//! Top-level entry point tying the cache, the remote client and the scheduler together.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;

use crate::cache::CompletionCache;
use crate::config::Config;
use crate::error::Result;
use crate::input::shuffle_items;
use crate::remote::ArchiveClient;
use crate::report::{RunSummary, TransferLog};
use crate::resolver::{FileFilter, FileResolver};
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::transfer::HttpFetcher;

/// Downloads a collection against the configured remote service
///
/// ```no_run
/// # async fn example() -> archive_dl::Result<()> {
/// use archive_dl::{CollectionDownloader, Config, report::TransferLog};
///
/// let downloader = CollectionDownloader::new(Config::default()).await?;
/// let summary = downloader
///     .run(vec!["some-item".to_string()], &mut TransferLog::disabled())
///     .await?;
/// downloader.shutdown().await;
/// std::process::exit(summary.exit_status().code().into());
/// # }
/// ```
pub struct CollectionDownloader {
    config: Config,
    cache: CompletionCache,
    scheduler: Scheduler,
}

impl CollectionDownloader {
    /// Validate `config`, open the completion cache and build the pipeline
    ///
    /// Fails if the configuration is invalid or the cache cannot be opened;
    /// both are fatal before any transfer starts.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let cache = CompletionCache::open(&config.persistence.cache_path).await?;
        let client = ArchiveClient::new(&config.remote)?;

        let filter = config
            .download
            .filter
            .as_deref()
            .map(FileFilter::new)
            .transpose()?;

        let mut resolver = FileResolver::new(Arc::new(client.clone()))
            .with_filter(filter)
            .with_retry(config.resolve_retry.clone());
        if config.persistence.cache_listings {
            resolver = resolver.with_listing_cache(cache.clone());
        }

        let fetcher = Arc::new(HttpFetcher::new(client, &config.remote));
        let scheduler = Scheduler::new(
            cache.clone(),
            resolver,
            fetcher,
            SchedulerOptions::from_config(&config),
        );

        tracing::info!(
            cache = %config.persistence.cache_path.display(),
            base_url = %config.remote.base_url,
            filter = config.download.filter.as_deref().unwrap_or("*"),
            "Downloader ready"
        );

        Ok(Self {
            config,
            cache,
            scheduler,
        })
    }

    /// Token that stops the current run; the binary wires it to SIGINT/SIGTERM
    pub fn cancellation_token(&self) -> CancellationToken {
        self.scheduler.cancellation_token()
    }

    /// The completion cache this downloader records into
    pub fn cache(&self) -> &CompletionCache {
        &self.cache
    }

    /// Run over `items`, shuffled first if configured
    pub async fn run(&self, mut items: Vec<String>, log: &mut TransferLog) -> Result<RunSummary> {
        if self.config.download.shuffle {
            let mut rng = match self.config.download.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            shuffle_items(&mut items, &mut rng);
        }

        let summary = self.scheduler.run(items, log).await?;
        summary.log();
        Ok(summary)
    }

    /// Flush and release the completion cache
    pub async fn shutdown(self) {
        self.cache.close().await;
        tracing::debug!("Completion cache closed");
    }
}
