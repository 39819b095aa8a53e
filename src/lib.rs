//! # archive-dl
//!
//! Resumable bulk downloader for collections of items hosted by a digital-archive service.
//!
//! A run takes a list of item identifiers, looks up the files of each item,
//! skips everything the completion cache already knows about, and transfers the
//! rest through a bounded pool of parallel workers. Each verified file is
//! recorded in the cache, so running again after a partial failure only fetches
//! what is still missing. The [`RunSummary`](report::RunSummary) says whether
//! another run is needed.
//!
//! ## Quick Start
//!
//! ```no_run
//! use archive_dl::{CollectionDownloader, Config, report::TransferLog};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.download.jobs = 8;
//!     config.download.filter = Some("*.warc.gz".to_string());
//!
//!     let downloader = CollectionDownloader::new(config).await?;
//!     archive_dl::cancel_on_signal(downloader.cancellation_token());
//!
//!     let items = vec!["item-one".to_string(), "item-two".to_string()];
//!     let summary = downloader.run(items, &mut TransferLog::disabled()).await?;
//!     downloader.shutdown().await;
//!
//!     println!("complete: {}", summary.is_success());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Durable completion records
pub mod cache;
/// Configuration types
pub mod config;
/// Wiring of cache, client, resolver and scheduler
pub mod downloader;
/// Error types
pub mod error;
/// Item identifier input
pub mod input;
/// HTTP client for the remote archive service
pub mod remote;
/// Run summary, exit status and transfer log
pub mod report;
/// Item file listings and filtering
pub mod resolver;
/// Retry logic with exponential backoff
pub mod retry;
/// Item and file orchestration over a bounded worker pool
pub mod scheduler;
/// Single-file transfers
pub mod transfer;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use cache::CompletionCache;
pub use config::Config;
pub use downloader::CollectionDownloader;
pub use error::{CacheError, Error, IntegrityError, ResolutionError, Result, TransferError};
pub use report::{ExitStatus, RunSummary};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use types::{CompletionRecord, FileDescriptor, ItemState};

/// Cancel `token` when the process receives a termination signal
///
/// Cancelling stops dispatch, aborts in-flight transfers and lets the run
/// return its summary, so completion records and the cache are flushed
/// normally.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub fn cancel_on_signal(
    token: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_signal() => {
                tracing::warn!("Stopping run; unfinished files will be fetched next time");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C signal");
            } else {
                // Never resolve: without a signal source the run is only stopped by finishing
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    }
}
