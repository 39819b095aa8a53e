//! File resolution: turning an item identifier into the files to download.
//!
//! [`FileSource`] is the seam to the remote metadata endpoint (implemented by
//! [`ArchiveClient`]); [`FileResolver`] wraps a source with in-run retries, the
//! optional listing cache, and the filename filter.

use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::cache::CompletionCache;
use crate::config::RetryConfig;
use crate::error::{Error, ResolutionError, Result};
use crate::remote::{ArchiveClient, ItemMetadata};
use crate::retry::with_retry;
use crate::types::FileDescriptor;

/// Where unfiltered file listings come from
#[async_trait::async_trait]
pub trait FileSource: Send + Sync {
    /// Every file of `item`, in the order the service lists them
    async fn list_files(&self, item: &str) -> std::result::Result<Vec<FileDescriptor>, ResolutionError>;
}

#[async_trait::async_trait]
impl FileSource for ArchiveClient {
    async fn list_files(&self, item: &str) -> std::result::Result<Vec<FileDescriptor>, ResolutionError> {
        let response = self.metadata_request(item).send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "timed out fetching metadata".to_string()
            } else if e.is_connect() {
                format!("connection failed: {}", e)
            } else {
                e.to_string()
            };
            ResolutionError::Transient {
                item: item.to_string(),
                reason,
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_metadata_status(item, status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| ResolutionError::Transient {
            item: item.to_string(),
            reason: format!("failed to read metadata body: {}", e),
        })?;

        let metadata: ItemMetadata =
            serde_json::from_slice(&body).map_err(|e| ResolutionError::Malformed {
                item: item.to_string(),
                reason: e.to_string(),
            })?;

        match metadata.files {
            Some(files) => Ok(files.into_iter().map(FileDescriptor::from).collect()),
            None => Err(ResolutionError::NotFound {
                item: item.to_string(),
            }),
        }
    }
}

fn classify_metadata_status(item: &str, status: u16) -> ResolutionError {
    let item = item.to_string();
    match status {
        404 => ResolutionError::NotFound { item },
        401 | 403 => ResolutionError::Denied { item, status },
        408 | 429 | 500..=599 => ResolutionError::Transient {
            item,
            reason: format!("HTTP {status}"),
        },
        _ => ResolutionError::Malformed {
            item,
            reason: format!("unexpected HTTP {status}"),
        },
    }
}

/// Filename filter
///
/// Shell-style globs; several alternatives may be joined with `|`. `*` also
/// matches `/`, so `*.warc.gz` selects WARCs in subdirectories too.
#[derive(Clone, Debug)]
pub struct FileFilter {
    pattern: String,
    set: GlobSet,
}

impl FileFilter {
    /// Compile a filter pattern
    pub fn new(pattern: &str) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut count = 0;
        for alternative in pattern.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            let glob = Glob::new(alternative).map_err(|e| {
                Error::config(
                    "filter",
                    format!("invalid filter pattern '{}': {}", alternative, e),
                )
            })?;
            builder.add(glob);
            count += 1;
        }

        if count == 0 {
            return Err(Error::config("filter", "filter pattern is empty"));
        }

        let set = builder
            .build()
            .map_err(|e| Error::config("filter", format!("invalid filter pattern: {}", e)))?;

        Ok(Self {
            pattern: pattern.to_string(),
            set,
        })
    }

    /// Whether a file name passes the filter
    pub fn matches(&self, name: &str) -> bool {
        self.set.is_match(name)
    }

    /// The pattern as given
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// The file resolver used by the scheduler
pub struct FileResolver {
    source: Arc<dyn FileSource>,
    filter: Option<FileFilter>,
    retry: RetryConfig,
    listing_cache: Option<CompletionCache>,
}

impl FileResolver {
    /// Resolver without filter, listing cache, or retries
    pub fn new(source: Arc<dyn FileSource>) -> Self {
        Self {
            source,
            filter: None,
            retry: RetryConfig::none(),
            listing_cache: None,
        }
    }

    /// Only return files matching `filter`
    pub fn with_filter(mut self, filter: Option<FileFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Retry transient lookup failures with this policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Store listings in (and serve them from) the cache
    pub fn with_listing_cache(mut self, cache: CompletionCache) -> Self {
        self.listing_cache = Some(cache);
        self
    }

    /// List the files of `item` that pass the filter
    ///
    /// The outer `Result` carries fatal cache errors; the inner one the
    /// item-level outcome.
    pub async fn resolve(
        &self,
        item: &str,
    ) -> Result<std::result::Result<Vec<FileDescriptor>, ResolutionError>> {
        let cached = match &self.listing_cache {
            Some(cache) => cache.cached_listing(item).await?,
            None => None,
        };

        let files = match cached {
            Some(files) => {
                tracing::debug!(item = %item, files = files.len(), "Using cached file listing");
                files
            }
            None => {
                let fetched = with_retry(&self.retry, || self.source.list_files(item)).await;
                let files = match fetched {
                    Ok(files) => files,
                    Err(e) => return Ok(Err(e)),
                };
                if let Some(cache) = &self.listing_cache {
                    cache.store_listing(item, &files).await?;
                }
                files
            }
        };

        Ok(Ok(self.apply_filter(files)))
    }

    fn apply_filter(&self, files: Vec<FileDescriptor>) -> Vec<FileDescriptor> {
        match &self.filter {
            Some(filter) => files.into_iter().filter(|f| filter.matches(&f.name)).collect(),
            None => files,
        }
    }
}
