//! Scheduler: drives items through resolution and their files through a bounded worker pool.
//!
//! Every decision (state transitions, completion lookups, aggregation) happens on
//! the task calling [`Scheduler::run`]. Pool tasks only move bytes and append the
//! completion record of the file they fetched, so a record exists exactly for
//! the files whose transfer succeeded.
//!
//! Item lifecycle:
//!
//! ```text
//! Pending -> Resolving -> Dispatching -> AwaitingWorkers -> done(success)
//!                 |             |                       \-> done(partial-failure)
//!                 |             \-> done(success)   (nothing left to fetch)
//!                 \-> done(partial-failure)         (listing failed)
//! ```

mod job;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::cache::CompletionCache;
use crate::config::{Config, DownloadConfig, RetryConfig};
use crate::error::{Error, ResolutionError, Result};
use crate::report::{FileFailure, ItemReport, RunSummary, TransferLog};
use crate::resolver::FileResolver;
use crate::transfer::Fetcher;
use crate::types::{FileDescriptor, ItemState};

use job::{FileJob, JobOutcome, JobResult};

/// Knobs of the scheduler
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// Destination root; files land at `<dest>/<item>/<file>`
    pub dest: PathBuf,
    /// Concurrent file transfers
    pub jobs: usize,
    /// Adopt matching destination files that have no completion record
    pub verify_existing: bool,
    /// Stop dispatching after more than this many file failures in a row
    pub max_consecutive_failures: Option<usize>,
    /// In-run retries for a single file
    pub transfer_retry: RetryConfig,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        let download = DownloadConfig::default();
        Self {
            dest: download.dest,
            jobs: download.jobs,
            verify_existing: download.verify_existing,
            max_consecutive_failures: download.max_consecutive_failures,
            transfer_retry: RetryConfig::transfers(),
        }
    }
}

impl SchedulerOptions {
    /// Options taken from a run configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            dest: config.download.dest.clone(),
            jobs: config.download.jobs,
            verify_existing: config.download.verify_existing,
            max_consecutive_failures: config.download.max_consecutive_failures,
            transfer_retry: config.transfer_retry.clone(),
        }
    }
}

/// The download orchestration engine
pub struct Scheduler {
    cache: CompletionCache,
    resolver: FileResolver,
    fetcher: Arc<dyn Fetcher>,
    options: SchedulerOptions,
    cancel: CancellationToken,
}

/// An item whose files are in the pool
struct OpenItem {
    report: ItemReport,
    outstanding: usize,
    /// Some files were never submitted because dispatch stopped
    abandoned: bool,
}

/// A file waiting for a free pool slot
struct ReadyFile {
    index: usize,
    item: String,
    file: FileDescriptor,
}

/// Mutable state of one run
struct RunState<'a> {
    summary: RunSummary,
    /// Items whose listing is being fetched, by input position
    resolving: BTreeMap<usize, String>,
    open: BTreeMap<usize, OpenItem>,
    ready: VecDeque<ReadyFile>,
    pool: JoinSet<Result<JobResult>>,
    consecutive_failures: usize,
    log: &'a mut TransferLog,
}

impl Scheduler {
    /// Create a scheduler over an open cache, a resolver and a fetcher
    pub fn new(
        cache: CompletionCache,
        resolver: FileResolver,
        fetcher: Arc<dyn Fetcher>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            cache,
            resolver,
            fetcher,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop dispatching and abort in-flight transfers when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels a running [`Scheduler::run`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Download every file of every item not already recorded complete
    ///
    /// Items are looked up in the order given, up to `jobs` at a time and ahead
    /// of the pool, so a slow listing never leaves free slots idle while other
    /// items have files waiting. Repeated identifiers are processed once.
    /// Item- and file-level failures end up in the returned summary; a
    /// completion cache error ends the run with `Err` after aborting in-flight
    /// transfers.
    pub async fn run(&self, items: Vec<String>, log: &mut TransferLog) -> Result<RunSummary> {
        let started = Instant::now();
        let jobs = self.options.jobs.max(1);
        let items = unique_items(items);

        tracing::info!(
            items = items.len(),
            jobs,
            dest = %self.options.dest.display(),
            "Starting run"
        );

        let mut state = RunState {
            summary: RunSummary {
                items_total: items.len(),
                ..RunSummary::default()
            },
            resolving: BTreeMap::new(),
            open: BTreeMap::new(),
            ready: VecDeque::new(),
            pool: JoinSet::new(),
            consecutive_failures: 0,
            log,
        };

        let mut queue: VecDeque<(usize, String)> = items.into_iter().enumerate().collect();
        let mut lookups = FuturesUnordered::new();

        loop {
            if self.should_stop(&state) {
                break;
            }

            // Look ahead only while the backlog would not fill the pool
            while lookups.len() < jobs
                && state.ready.len() < jobs
                && let Some((index, item)) = queue.pop_front()
            {
                tracing::debug!(item = %item, "Resolving item");
                state.resolving.insert(index, item.clone());
                let resolver = &self.resolver;
                lookups.push(async move {
                    let resolved = resolver.resolve(&item).await;
                    (index, item, resolved)
                });
            }

            while state.pool.len() < jobs
                && let Some(ready) = state.ready.pop_front()
            {
                self.dispatch(ready, &mut state);
            }

            if state.pool.is_empty() && lookups.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = state.pool.join_next(), if !state.pool.is_empty() => {
                    self.handle_joined(joined, &mut state)?;
                }
                Some((index, item, resolved)) = lookups.next(), if !lookups.is_empty() => {
                    self.handle_resolved(index, item, resolved?, &mut state).await?;
                }
            }
        }

        // Lookups still running are dropped; their items count as unfinished
        drop(lookups);
        let never_dispatched = std::mem::take(&mut state.ready);
        for ready in never_dispatched {
            self.abandon(ready.index, 1, &mut state);
        }

        self.drain(&mut state).await?;

        if self.cancel.is_cancelled() && state.summary.aborted.is_none() {
            state.summary.aborted = Some("cancelled".to_string());
        }

        // Whatever did not reach a terminal state counts as failed
        let open = std::mem::take(&mut state.open);
        for (_, open_item) in open {
            state.summary.record_item(open_item.report);
        }
        let resolving = std::mem::take(&mut state.resolving);
        for (_, item) in resolving {
            let mut report = ItemReport::new(&item);
            report.state = ItemState::Resolving;
            state.summary.record_item(report);
        }
        for (_, item) in queue {
            state.summary.record_item(ItemReport::new(&item));
        }

        state.summary.elapsed = started.elapsed();
        Ok(state.summary)
    }

    fn should_stop(&self, state: &RunState<'_>) -> bool {
        self.cancel.is_cancelled() || state.summary.aborted.is_some()
    }

    /// Turn a finished lookup into files waiting for the pool
    async fn handle_resolved(
        &self,
        index: usize,
        item: String,
        resolved: std::result::Result<Vec<FileDescriptor>, ResolutionError>,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        state.resolving.remove(&index);

        let files = match resolved {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(item = %item, error = %e, "Failed to resolve item");
                state.summary.record_item(ItemReport::unresolved(&item, &e));
                return Ok(());
            }
        };

        let mut report = ItemReport::new(&item);
        report.state = ItemState::Dispatching;
        report.files_listed = files.len();

        let mut pending = Vec::with_capacity(files.len());
        for file in files {
            if self.cache.is_complete(&item, &file.name).await? {
                report.files_skipped += 1;
                state.summary.files_skipped += 1;
            } else {
                pending.push(file);
            }
        }

        if pending.is_empty() {
            tracing::debug!(item = %item, skipped = report.files_skipped, "Nothing left to fetch");
            report.state = ItemState::Succeeded;
            state.summary.record_item(report);
            return Ok(());
        }

        report.state = ItemState::AwaitingWorkers;
        tracing::info!(
            item = %item,
            files = pending.len(),
            skipped = report.files_skipped,
            "Dispatching files"
        );

        state.open.insert(
            index,
            OpenItem {
                report,
                outstanding: pending.len(),
                abandoned: false,
            },
        );
        state.ready.extend(pending.into_iter().map(|file| ReadyFile {
            index,
            item: item.clone(),
            file,
        }));

        Ok(())
    }

    fn dispatch(&self, ready: ReadyFile, state: &mut RunState<'_>) {
        state.pool.spawn(
            FileJob {
                index: ready.index,
                item: ready.item,
                file: ready.file,
                dest: self.options.dest.clone(),
                cache: self.cache.clone(),
                fetcher: Arc::clone(&self.fetcher),
                retry: self.options.transfer_retry.clone(),
                verify_existing: self.options.verify_existing,
            }
            .run(),
        );
    }

    /// Wait for in-flight transfers, or abort them on cancellation
    async fn drain(&self, state: &mut RunState<'_>) -> Result<()> {
        while !state.pool.is_empty() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::warn!(in_flight = state.pool.len(), "Cancelled; aborting in-flight transfers");
                    state.pool.shutdown().await;
                    break;
                }
                Some(joined) = state.pool.join_next() => self.handle_joined(joined, state)?,
            }
        }
        Ok(())
    }

    /// Files of an open item that will never be submitted
    fn abandon(&self, index: usize, count: usize, state: &mut RunState<'_>) {
        if let Some(open) = state.open.get_mut(&index) {
            open.abandoned = true;
            open.outstanding -= count;
        }
        self.finish_if_done(index, state);
    }

    fn handle_joined(
        &self,
        joined: std::result::Result<Result<JobResult>, JoinError>,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        let result = joined
            .map_err(|e| Error::Other(format!("transfer task failed: {}", e)))??;
        let index = result.index;

        let Some(open) = state.open.get_mut(&index) else {
            return Ok(());
        };
        let item = open.report.item.clone();

        match result.outcome {
            JobOutcome::Transferred(transferred) => {
                state.summary.files_attempted += 1;
                state.summary.files_succeeded += 1;
                state.summary.bytes_transferred += transferred.size;
                state.consecutive_failures = 0;
                open.report.files_succeeded += 1;
                state.log.success(&item, &result.file, &transferred);
            }
            JobOutcome::Adopted(adopted) => {
                state.summary.files_adopted += 1;
                state.consecutive_failures = 0;
                open.report.files_adopted += 1;
                state.log.success(&item, &result.file, &adopted);
            }
            JobOutcome::Failed(error) => {
                tracing::warn!(
                    item = %item,
                    file = %result.file.name,
                    kind = error.kind(),
                    error = %error,
                    "File transfer failed"
                );
                state.summary.files_attempted += 1;
                state.summary.files_failed += 1;
                state.consecutive_failures += 1;
                open.report
                    .failures
                    .push(FileFailure::new(&result.file.name, &error));
                state.log.failure(&item, &result.file, &error);
                self.check_breaker(state);
            }
        }

        if let Some(open) = state.open.get_mut(&index) {
            open.outstanding -= 1;
        }
        self.finish_if_done(index, state);
        Ok(())
    }

    fn check_breaker(&self, state: &mut RunState<'_>) {
        let Some(max) = self.options.max_consecutive_failures else {
            return;
        };
        if state.consecutive_failures > max && state.summary.aborted.is_none() {
            tracing::error!(
                failures = state.consecutive_failures,
                "Too many consecutive failures; no longer dispatching"
            );
            state.summary.aborted = Some(format!("more than {} consecutive file failures", max));
        }
    }

    fn finish_if_done(&self, index: usize, state: &mut RunState<'_>) {
        let done = state
            .open
            .get(&index)
            .is_some_and(|open| open.outstanding == 0);
        if !done {
            return;
        }

        if let Some(mut open) = state.open.remove(&index) {
            open.report.state = if open.report.failures.is_empty() && !open.abandoned {
                ItemState::Succeeded
            } else {
                ItemState::PartialFailure
            };
            tracing::info!(
                item = %open.report.item,
                state = %open.report.state,
                succeeded = open.report.files_succeeded,
                adopted = open.report.files_adopted,
                failed = open.report.failures.len(),
                "Item finished"
            );
            state.summary.record_item(open.report);
        }
    }
}

/// Drop repeated identifiers, keeping the first occurrence of each
fn unique_items(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(items.len());
    let before = items.len();
    let unique: Vec<String> = items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect();
    if unique.len() < before {
        tracing::debug!(duplicates = before - unique.len(), "Ignoring repeated identifiers");
    }
    unique
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
