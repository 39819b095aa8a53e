//! One file's trip through the worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::CompletionCache;
use crate::config::RetryConfig;
use crate::error::{Result, TransferError};
use crate::retry::with_retry;
use crate::transfer::{Fetcher, verify};
use crate::types::{FileDescriptor, Transferred};
use crate::utils::{compute_md5, destination_path};

/// What a pool task reports back to the scheduler
pub(super) struct JobResult {
    pub(super) index: usize,
    pub(super) file: FileDescriptor,
    pub(super) outcome: JobOutcome,
}

pub(super) enum JobOutcome {
    /// Bytes fetched and completion recorded
    Transferred(Transferred),
    /// Existing destination file matched the listing; completion recorded
    Adopted(Transferred),
    /// Nothing recorded
    Failed(TransferError),
}

/// Everything a pool task needs, owned so it can be spawned
pub(super) struct FileJob {
    pub(super) index: usize,
    pub(super) item: String,
    pub(super) file: FileDescriptor,
    pub(super) dest: PathBuf,
    pub(super) cache: CompletionCache,
    pub(super) fetcher: Arc<dyn Fetcher>,
    pub(super) retry: RetryConfig,
    pub(super) verify_existing: bool,
}

impl FileJob {
    /// Transfer (or adopt) the file and append its completion record
    ///
    /// Only a cache failure is returned as `Err`; it ends the run.
    pub(super) async fn run(self) -> Result<JobResult> {
        let outcome = self.execute().await?;
        Ok(JobResult {
            index: self.index,
            file: self.file,
            outcome,
        })
    }

    async fn execute(&self) -> Result<JobOutcome> {
        let destination = match destination_path(&self.dest, &self.item, &self.file.name) {
            Ok(path) => path,
            Err(e) => return Ok(JobOutcome::Failed(TransferError::Storage(e))),
        };

        if self.verify_existing
            && let Some(adopted) = self.adopt_existing(&destination).await
        {
            self.record(&adopted).await?;
            return Ok(JobOutcome::Adopted(adopted));
        }

        let fetched = with_retry(&self.retry, || {
            self.fetcher.fetch(&self.item, &self.file, &destination)
        })
        .await;

        match fetched {
            Ok(transferred) => {
                self.record(&transferred).await?;
                Ok(JobOutcome::Transferred(transferred))
            }
            Err(e) => Ok(JobOutcome::Failed(e)),
        }
    }

    async fn record(&self, transferred: &Transferred) -> Result<()> {
        self.cache
            .mark_complete(
                &self.item,
                &self.file.name,
                Some(transferred.size),
                Some(&transferred.md5),
            )
            .await
    }

    /// Check a destination file left by an earlier, unrecorded download
    ///
    /// Adoption needs a listed checksum. A file that does not match is removed
    /// and `None` is returned so the caller downloads it again.
    async fn adopt_existing(&self, destination: &Path) -> Option<Transferred> {
        self.file.md5.as_ref()?;

        let metadata = tokio::fs::metadata(destination).await.ok()?;
        if !metadata.is_file() {
            return None;
        }

        let started = Instant::now();
        let md5 = match compute_md5(destination).await {
            Ok(md5) => md5,
            Err(e) => {
                tracing::warn!(
                    path = %destination.display(),
                    error = %e,
                    "Cannot hash existing file; downloading again"
                );
                return None;
            }
        };

        match verify(&self.file, metadata.len(), &md5) {
            Ok(()) => {
                tracing::info!(item = %self.item, file = %self.file.name, "Adopted existing file");
                Some(Transferred {
                    path: destination.to_path_buf(),
                    size: metadata.len(),
                    md5,
                    elapsed: started.elapsed(),
                })
            }
            Err(mismatch) => {
                tracing::warn!(
                    item = %self.item,
                    file = %self.file.name,
                    reason = %mismatch,
                    "Existing file does not match listing; downloading again"
                );
                if let Err(e) = tokio::fs::remove_file(destination).await {
                    tracing::warn!(path = %destination.display(), error = %e, "Failed to remove mismatched file");
                }
                None
            }
        }
    }
}
