//! Scheduler tests against in-memory sources and fetchers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;

use super::*;
use crate::error::{IntegrityError, ResolutionError, TransferError};
use crate::resolver::{FileFilter, FileSource};
use crate::types::{FileDescriptor, TransferOutcome, Transferred};

const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";

/// Listings served from memory; unknown items are `NotFound`
#[derive(Default)]
struct MemorySource {
    items: HashMap<String, Vec<FileDescriptor>>,
}

impl MemorySource {
    fn with(mut self, item: &str, files: &[&str]) -> Self {
        self.items.insert(
            item.to_string(),
            files.iter().map(|f| abc_file(f)).collect(),
        );
        self
    }
}

#[async_trait::async_trait]
impl FileSource for MemorySource {
    async fn list_files(
        &self,
        item: &str,
    ) -> std::result::Result<Vec<FileDescriptor>, ResolutionError> {
        self.items
            .get(item)
            .cloned()
            .ok_or_else(|| ResolutionError::NotFound {
                item: item.to_string(),
            })
    }
}

/// Holds back one item's listing until the fetcher has seen `release_after` calls
struct GatedSource {
    inner: MemorySource,
    gated: String,
    fetcher: Arc<ScriptedFetcher>,
    release_after: usize,
}

#[async_trait::async_trait]
impl FileSource for GatedSource {
    async fn list_files(
        &self,
        item: &str,
    ) -> std::result::Result<Vec<FileDescriptor>, ResolutionError> {
        if item == self.gated {
            let released = tokio::time::timeout(Duration::from_secs(5), async {
                while self.fetcher.call_count() < self.release_after {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            if released.is_err() {
                return Err(ResolutionError::Transient {
                    item: item.to_string(),
                    reason: "gate never opened".to_string(),
                });
            }
        }
        self.inner.list_files(item).await
    }
}

#[derive(Clone, Copy)]
enum Failure {
    Timeout,
    Transient,
    Corrupt,
}

/// Fetcher writing `abc` to the destination, with scripted failures
#[derive(Default)]
struct ScriptedFetcher {
    /// (item, file) -> failure, and how many times it fails (`usize::MAX` = always)
    failures: Mutex<HashMap<(String, String), (Failure, usize)>>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl ScriptedFetcher {
    fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn fail(self, item: &str, file: &str, failure: Failure, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((item.to_string(), file.to_string()), (failure, times));
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<(String, String)> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }

    fn next_failure(&self, item: &str, file: &str) -> Option<Failure> {
        let mut failures = self.failures.lock().unwrap();
        let entry = failures.get_mut(&(item.to_string(), file.to_string()))?;
        if entry.1 == 0 {
            return None;
        }
        if entry.1 != usize::MAX {
            entry.1 -= 1;
        }
        Some(entry.0)
    }
}

#[async_trait::async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        item: &str,
        file: &FileDescriptor,
        destination: &Path,
    ) -> TransferOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((item.to_string(), file.name.clone()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.next_failure(item, &file.name) {
            Some(Failure::Timeout) => return Err(TransferError::Timeout(Duration::from_secs(1))),
            Some(Failure::Transient) => return Err(TransferError::Transient("HTTP 503".into())),
            Some(Failure::Corrupt) => {
                return Err(TransferError::Integrity(IntegrityError::Checksum {
                    expected: ABC_MD5.to_string(),
                    actual: "0".repeat(32),
                }));
            }
            None => {}
        }

        tokio::fs::create_dir_all(destination.parent().unwrap()).await?;
        tokio::fs::write(destination, b"abc").await?;
        Ok(Transferred {
            path: destination.to_path_buf(),
            size: 3,
            md5: ABC_MD5.to_string(),
            elapsed: Duration::from_millis(1),
        })
    }
}

fn abc_file(name: &str) -> FileDescriptor {
    FileDescriptor {
        name: name.to_string(),
        size: Some(3),
        md5: Some(ABC_MD5.to_string()),
    }
}

fn items(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

struct Harness {
    _dir: TempDir,
    dest: PathBuf,
    cache: CompletionCache,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompletionCache::open(&dir.path().join("cache.sqlite"))
            .await
            .unwrap();
        Self {
            dest: dir.path().join("dest"),
            _dir: dir,
            cache,
        }
    }

    fn options(&self, jobs: usize) -> SchedulerOptions {
        SchedulerOptions {
            dest: self.dest.clone(),
            jobs,
            verify_existing: false,
            max_consecutive_failures: None,
            transfer_retry: RetryConfig::none(),
        }
    }

    fn scheduler(
        &self,
        source: MemorySource,
        fetcher: Arc<ScriptedFetcher>,
        options: SchedulerOptions,
    ) -> Scheduler {
        Scheduler::new(
            self.cache.clone(),
            FileResolver::new(Arc::new(source)),
            fetcher,
            options,
        )
    }
}

fn two_items() -> MemorySource {
    MemorySource::default()
        .with("A", &["a1", "a2"])
        .with("B", &["b1"])
}

fn report<'a>(summary: &'a RunSummary, item: &str) -> &'a ItemReport {
    summary.items.iter().find(|r| r.item == item).unwrap()
}

#[tokio::test]
async fn full_run_then_rerun_transfers_nothing() {
    let h = Harness::new().await;
    let fetcher = Arc::new(ScriptedFetcher::default());
    let scheduler = h.scheduler(two_items(), fetcher.clone(), h.options(2));

    let summary = scheduler
        .run(items(&["A", "B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.files_attempted, 3);
    assert_eq!(summary.files_succeeded, 3);
    assert_eq!(summary.bytes_transferred, 9);
    assert_eq!(summary.items_succeeded, 2);
    assert_eq!(h.cache.count().await.unwrap(), 3);
    assert!(h.dest.join("A").join("a1").is_file());
    assert!(h.dest.join("B").join("b1").is_file());

    let rerun_fetcher = Arc::new(ScriptedFetcher::default());
    let rerun = h.scheduler(two_items(), rerun_fetcher.clone(), h.options(2));
    let summary = rerun
        .run(items(&["A", "B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.files_attempted, 0);
    assert_eq!(summary.files_skipped, 3);
    assert!(rerun_fetcher.calls().is_empty());
}

#[tokio::test]
async fn timed_out_file_fails_only_its_item_and_is_retried_next_run() {
    let h = Harness::new().await;
    let fetcher = Arc::new(ScriptedFetcher::default().fail("B", "b1", Failure::Timeout, usize::MAX));
    let scheduler = h.scheduler(two_items(), fetcher, h.options(2));

    let summary = scheduler
        .run(items(&["A", "B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(!summary.is_success());
    assert_eq!(report(&summary, "A").state, ItemState::Succeeded);
    let b = report(&summary, "B");
    assert_eq!(b.state, ItemState::PartialFailure);
    assert_eq!(b.failures.len(), 1);
    assert_eq!(b.failures[0].file, "b1");
    assert_eq!(b.failures[0].kind, "timeout");
    assert!(h.cache.is_complete("A", "a1").await.unwrap());
    assert!(h.cache.is_complete("A", "a2").await.unwrap());
    assert!(!h.cache.is_complete("B", "b1").await.unwrap());

    let rerun_fetcher = Arc::new(ScriptedFetcher::default());
    let summary = h
        .scheduler(two_items(), rerun_fetcher.clone(), h.options(2))
        .run(items(&["A", "B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(
        rerun_fetcher.calls(),
        vec![("B".to_string(), "b1".to_string())]
    );
}

#[tokio::test]
async fn unresolvable_item_does_not_affect_others() {
    let h = Harness::new().await;
    let source = MemorySource::default().with("B", &["b1"]).with("C", &["c1"]);
    let fetcher = Arc::new(ScriptedFetcher::default());

    let summary = h
        .scheduler(source, fetcher.clone(), h.options(2))
        .run(items(&["A", "B", "C"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    let a = report(&summary, "A");
    assert_eq!(a.state, ItemState::PartialFailure);
    assert!(a.resolution_error.is_some());
    assert_eq!(report(&summary, "B").state, ItemState::Succeeded);
    assert_eq!(report(&summary, "C").state, ItemState::Succeeded);
    assert_eq!(summary.items_failed, 1);
    assert_eq!(fetcher.calls().len(), 2);
}

#[tokio::test]
async fn corrupt_transfer_is_never_recorded() {
    let h = Harness::new().await;
    let fetcher = Arc::new(ScriptedFetcher::default().fail("A", "a2", Failure::Corrupt, usize::MAX));

    let summary = h
        .scheduler(two_items(), fetcher, h.options(1))
        .run(items(&["A"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(!summary.is_success());
    assert_eq!(report(&summary, "A").failures[0].kind, "integrity");
    assert!(h.cache.is_complete("A", "a1").await.unwrap());
    assert!(!h.cache.is_complete("A", "a2").await.unwrap());
}

#[tokio::test]
async fn filtered_out_files_are_never_dispatched_or_counted() {
    let h = Harness::new().await;
    let source = MemorySource::default().with("A", &["a.warc.gz", "a.cdx.gz", "a_meta.xml"]);
    let fetcher = Arc::new(ScriptedFetcher::default());
    let resolver = FileResolver::new(Arc::new(source))
        .with_filter(Some(FileFilter::new("*.warc.gz").unwrap()));
    let scheduler = Scheduler::new(h.cache.clone(), resolver, fetcher.clone(), h.options(2));

    let summary = scheduler
        .run(items(&["A"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(report(&summary, "A").files_listed, 1);
    assert_eq!(summary.files_attempted, 1);
    assert_eq!(
        fetcher.calls(),
        vec![("A".to_string(), "a.warc.gz".to_string())]
    );
    assert_eq!(h.cache.count().await.unwrap(), 1);
}

#[tokio::test]
async fn item_with_every_file_filtered_out_succeeds() {
    let h = Harness::new().await;
    let source = MemorySource::default().with("A", &["a_meta.xml"]);
    let resolver = FileResolver::new(Arc::new(source))
        .with_filter(Some(FileFilter::new("*.warc.gz").unwrap()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    let scheduler = Scheduler::new(h.cache.clone(), resolver, fetcher.clone(), h.options(2));

    let summary = scheduler
        .run(items(&["A"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.files_attempted, 0);
    assert!(fetcher.calls().is_empty());
}

#[tokio::test]
async fn pool_never_exceeds_jobs() {
    let h = Harness::new().await;
    let names: Vec<String> = (0..12).map(|i| format!("f{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let source = MemorySource::default()
        .with("A", &refs[..6])
        .with("B", &refs[6..]);
    let fetcher = Arc::new(ScriptedFetcher::delayed(Duration::from_millis(30)));

    let summary = h
        .scheduler(source, fetcher.clone(), h.options(3))
        .run(items(&["A", "B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.files_succeeded, 12);
    assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn slow_listing_does_not_idle_the_pool() {
    let h = Harness::new().await;
    let fetcher = Arc::new(ScriptedFetcher::delayed(Duration::from_millis(50)));
    let source = GatedSource {
        inner: MemorySource::default()
            .with("A", &["a1", "a2"])
            .with("B", &["b1"])
            .with("C", &["c1", "c2", "c3", "c4"]),
        gated: "B".to_string(),
        fetcher: fetcher.clone(),
        release_after: 6,
    };
    let scheduler = Scheduler::new(
        h.cache.clone(),
        FileResolver::new(Arc::new(source)),
        fetcher.clone(),
        h.options(4),
    );

    let summary = scheduler
        .run(items(&["A", "B", "C"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(report(&summary, "B").state, ItemState::Succeeded);
    assert_eq!(summary.files_succeeded, 7);
    assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 4);
    // B's file was only listed once A and C had all been fetched
    let order = fetcher.calls.lock().unwrap().clone();
    assert_eq!(order.last().unwrap(), &("B".to_string(), "b1".to_string()));
}

#[tokio::test]
async fn repeated_identifiers_are_downloaded_once() {
    let h = Harness::new().await;
    let fetcher = Arc::new(ScriptedFetcher::delayed(Duration::from_millis(20)));

    let summary = h
        .scheduler(two_items(), fetcher.clone(), h.options(4))
        .run(items(&["A", "A", "B", "A"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.items_total, 2);
    assert_eq!(summary.items.len(), 2);
    assert_eq!(summary.files_attempted, 3);
    assert_eq!(
        fetcher.calls(),
        vec![
            ("A".to_string(), "a1".to_string()),
            ("A".to_string(), "a2".to_string()),
            ("B".to_string(), "b1".to_string()),
        ]
    );
    assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[test]
fn unique_items_keeps_first_occurrence_order() {
    let unique = unique_items(items(&["b", "a", "b", "c", "a"]));
    assert_eq!(unique, vec!["b", "a", "c"]);
}

#[tokio::test]
async fn transient_failure_is_retried_within_the_run() {
    let h = Harness::new().await;
    let fetcher = Arc::new(ScriptedFetcher::default().fail("B", "b1", Failure::Transient, 1));
    let options = SchedulerOptions {
        transfer_retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        ..h.options(2)
    };

    let summary = h
        .scheduler(two_items(), fetcher.clone(), options)
        .run(items(&["B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.files_attempted, 1);
    assert_eq!(fetcher.calls().len(), 2);
}

#[tokio::test]
async fn consecutive_failures_stop_dispatch() {
    let h = Harness::new().await;
    let mut source = MemorySource::default();
    let mut fetcher = ScriptedFetcher::default();
    let ids: Vec<String> = (0..10).map(|i| format!("item{i}")).collect();
    for id in &ids {
        source = source.with(id, &["f"]);
        fetcher = fetcher.fail(id, "f", Failure::Transient, usize::MAX);
    }
    let fetcher = Arc::new(fetcher);
    let options = SchedulerOptions {
        max_consecutive_failures: Some(2),
        ..h.options(1)
    };

    let summary = h
        .scheduler(source, fetcher.clone(), options)
        .run(ids.clone(), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.aborted.is_some());
    assert!(!summary.is_success());
    assert_eq!(summary.files_failed, 3);
    assert_eq!(fetcher.calls().len(), 3);
    assert_eq!(summary.items.len(), 10);
    assert_eq!(summary.items_failed, 10);
}

#[tokio::test]
async fn a_success_resets_the_failure_streak() {
    let h = Harness::new().await;
    let source = MemorySource::default()
        .with("A", &["x"])
        .with("B", &["y"])
        .with("C", &["z"]);
    let fetcher = Arc::new(
        ScriptedFetcher::default()
            .fail("A", "x", Failure::Transient, usize::MAX)
            .fail("C", "z", Failure::Transient, usize::MAX),
    );
    let options = SchedulerOptions {
        max_consecutive_failures: Some(1),
        ..h.options(1)
    };

    let summary = h
        .scheduler(source, fetcher.clone(), options)
        .run(items(&["A", "B", "C"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.aborted.is_none());
    assert_eq!(fetcher.calls().len(), 3);
    assert_eq!(summary.items_failed, 2);
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let h = Harness::new().await;
    let fetcher = Arc::new(ScriptedFetcher::default());
    let token = CancellationToken::new();
    token.cancel();

    let summary = h
        .scheduler(two_items(), fetcher.clone(), h.options(2))
        .with_cancellation(token)
        .run(items(&["A", "B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert_eq!(summary.aborted.as_deref(), Some("cancelled"));
    assert_eq!(summary.items_failed, 2);
    assert!(fetcher.calls().is_empty());
    assert_eq!(h.cache.count().await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_aborts_in_flight_transfers() {
    let h = Harness::new().await;
    let fetcher = Arc::new(ScriptedFetcher::delayed(Duration::from_secs(30)));
    let scheduler = h.scheduler(two_items(), fetcher, h.options(2));
    let token = scheduler.cancellation_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        scheduler.run(items(&["A", "B"]), &mut TransferLog::disabled()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.aborted.as_deref(), Some("cancelled"));
    assert_eq!(summary.items.len(), 2);
    assert_eq!(h.cache.count().await.unwrap(), 0);
}

#[tokio::test]
async fn matching_existing_file_is_adopted_without_transfer() {
    let h = Harness::new().await;
    let existing = h.dest.join("B").join("b1");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, b"abc").unwrap();

    let fetcher = Arc::new(ScriptedFetcher::default());
    let options = SchedulerOptions {
        verify_existing: true,
        ..h.options(2)
    };

    let summary = h
        .scheduler(two_items(), fetcher.clone(), options)
        .run(items(&["B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.files_adopted, 1);
    assert_eq!(summary.files_attempted, 0);
    assert!(fetcher.calls().is_empty());
    assert!(h.cache.is_complete("B", "b1").await.unwrap());
}

#[tokio::test]
async fn mismatching_existing_file_is_downloaded_again() {
    let h = Harness::new().await;
    let existing = h.dest.join("B").join("b1");
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, b"xyz").unwrap();

    let fetcher = Arc::new(ScriptedFetcher::default());
    let options = SchedulerOptions {
        verify_existing: true,
        ..h.options(2)
    };

    let summary = h
        .scheduler(two_items(), fetcher.clone(), options)
        .run(items(&["B"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.files_adopted, 0);
    assert_eq!(summary.files_succeeded, 1);
    assert_eq!(fetcher.calls().len(), 1);
    assert_eq!(std::fs::read(&existing).unwrap(), b"abc");
}

#[tokio::test]
async fn unsafe_file_name_fails_only_that_file() {
    let h = Harness::new().await;
    let source = MemorySource::default().with("A", &["../escape", "ok"]);
    let fetcher = Arc::new(ScriptedFetcher::default());

    let summary = h
        .scheduler(source, fetcher.clone(), h.options(2))
        .run(items(&["A"]), &mut TransferLog::disabled())
        .await
        .unwrap();

    let a = report(&summary, "A");
    assert_eq!(a.state, ItemState::PartialFailure);
    assert_eq!(a.failures.len(), 1);
    assert_eq!(a.failures[0].kind, "storage");
    assert_eq!(fetcher.calls(), vec![("A".to_string(), "ok".to_string())]);
}

#[tokio::test]
async fn cache_failure_aborts_the_run() {
    let h = Harness::new().await;
    h.cache.pool().close().await;
    let fetcher = Arc::new(ScriptedFetcher::default());

    let result = h
        .scheduler(two_items(), fetcher, h.options(2))
        .run(items(&["A"]), &mut TransferLog::disabled())
        .await;

    assert!(matches!(result, Err(Error::Cache(_))));
}
