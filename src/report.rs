//! Run report: what happened to every item, and whether another run is needed.
//!
//! The scheduler fills a [`RunSummary`] as items finish. The binary turns it into
//! an [`ExitStatus`] so a supervisor can keep re-invoking until the collection is
//! complete. Every finished file is also written to a [`TransferLog`], one
//! tab-separated row per file.

use std::io::Write;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::{ResolutionError, TransferError};
use crate::types::{FileDescriptor, ItemState, Transferred};
use crate::utils::format_bytes;

/// One file of an item that did not make it
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    /// File name within the item
    pub file: String,
    /// Short error class, see [`TransferError::kind`]
    pub kind: String,
    /// Human-readable reason
    pub reason: String,
}

impl FileFailure {
    /// Build from a transfer error
    pub fn new(file: &str, error: &TransferError) -> Self {
        Self {
            file: file.to_string(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

/// The fate of one item
#[derive(Clone, Debug, Serialize)]
pub struct ItemReport {
    /// Item identifier
    pub item: String,
    /// Terminal state (or the state the item was stuck in when the run ended)
    pub state: ItemState,
    /// Files left after filtering
    pub files_listed: usize,
    /// Files skipped because a completion record already existed
    pub files_skipped: usize,
    /// Files recorded complete after checking an existing destination file
    pub files_adopted: usize,
    /// Files transferred and recorded in this run
    pub files_succeeded: usize,
    /// Files that failed in this run
    pub failures: Vec<FileFailure>,
    /// Why the file listing could not be obtained
    pub resolution_error: Option<String>,
}

impl ItemReport {
    /// Fresh report for an item that has not been looked at yet
    pub fn new(item: &str) -> Self {
        Self {
            item: item.to_string(),
            state: ItemState::Pending,
            files_listed: 0,
            files_skipped: 0,
            files_adopted: 0,
            files_succeeded: 0,
            failures: Vec::new(),
            resolution_error: None,
        }
    }

    /// Report for an item whose listing failed
    pub fn unresolved(item: &str, error: &ResolutionError) -> Self {
        Self {
            state: ItemState::PartialFailure,
            resolution_error: Some(error.to_string()),
            ..Self::new(item)
        }
    }

    /// Whether the item ended fully downloaded
    pub fn is_success(&self) -> bool {
        self.state == ItemState::Succeeded
    }
}

/// Aggregate outcome of one run
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    /// Items read from the input
    pub items_total: usize,
    /// Items that ended in `done(success)`
    pub items_succeeded: usize,
    /// Items that ended in `done(partial-failure)` or never finished
    pub items_failed: usize,
    /// Transfers started
    pub files_attempted: usize,
    /// Transfers that succeeded and were recorded
    pub files_succeeded: usize,
    /// Transfers that failed
    pub files_failed: usize,
    /// Files skipped because they were already complete
    pub files_skipped: usize,
    /// Existing destination files recorded without a transfer
    pub files_adopted: usize,
    /// Bytes received by successful transfers
    pub bytes_transferred: u64,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
    /// Why dispatch stopped early, if it did
    pub aborted: Option<String>,
    /// Per-item detail, in the order items finished
    pub items: Vec<ItemReport>,
}

impl RunSummary {
    /// Fold a finished item into the totals
    pub fn record_item(&mut self, report: ItemReport) {
        if report.is_success() {
            self.items_succeeded += 1;
        } else {
            self.items_failed += 1;
        }
        self.items.push(report);
    }

    /// True iff every item reached `done(success)` and the run was not cut short
    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
            && self.items_failed == 0
            && self.items_succeeded == self.items_total
    }

    /// Exit status for the supervisor
    pub fn exit_status(&self) -> ExitStatus {
        if self.is_success() {
            ExitStatus::Success
        } else {
            ExitStatus::Incomplete
        }
    }

    /// Items that need another run
    pub fn failed_items(&self) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(|r| !r.is_success())
    }

    /// Emit the summary and every failure through `tracing`
    pub fn log(&self) {
        for report in self.failed_items() {
            if let Some(reason) = &report.resolution_error {
                tracing::warn!(item = %report.item, reason = %reason, "Item could not be resolved");
            }
            for failure in &report.failures {
                tracing::warn!(
                    item = %report.item,
                    file = %failure.file,
                    kind = %failure.kind,
                    reason = %failure.reason,
                    "File failed"
                );
            }
            if report.resolution_error.is_none() && report.failures.is_empty() {
                tracing::warn!(item = %report.item, state = %report.state, "Item did not finish");
            }
        }

        if let Some(reason) = &self.aborted {
            tracing::error!(reason = %reason, "Run aborted");
        }

        tracing::info!(
            items = self.items_total,
            items_succeeded = self.items_succeeded,
            items_failed = self.items_failed,
            files_attempted = self.files_attempted,
            files_succeeded = self.files_succeeded,
            files_failed = self.files_failed,
            files_skipped = self.files_skipped,
            files_adopted = self.files_adopted,
            transferred = %format_bytes(self.bytes_transferred),
            elapsed_secs = self.elapsed.as_secs(),
            success = self.is_success(),
            "Run finished"
        );
    }
}

/// Process exit status consumed by the retry supervisor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// Every item is complete
    Success,
    /// Some work is left; running again is worthwhile
    Incomplete,
    /// Configuration or completion cache failure; running again will not help
    Fatal,
}

impl ExitStatus {
    /// Numeric process exit code
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Incomplete => 1,
            ExitStatus::Fatal => 2,
        }
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}

/// Columns of the transfer log
pub const TRANSFER_LOG_COLUMNS: [&str; 8] =
    ["timestamp", "item", "name", "path", "size", "time", "md5", "error"];

/// Tab-separated record of every finished file
///
/// Write failures are logged and otherwise ignored; losing a log row must not
/// fail a run whose completion records are already durable.
pub struct TransferLog {
    sink: Option<Box<dyn Write + Send>>,
}

impl TransferLog {
    /// Log to `sink`, starting with the header row
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        let mut log = Self { sink: Some(sink) };
        log.write_row(&TRANSFER_LOG_COLUMNS.map(String::from));
        log
    }

    /// Log that discards everything
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Row for a transferred (or adopted) file
    pub fn success(&mut self, item: &str, file: &FileDescriptor, transferred: &Transferred) {
        self.write_row(&[
            Utc::now().to_rfc3339(),
            item.to_string(),
            file.name.clone(),
            transferred.path.display().to_string(),
            transferred.size.to_string(),
            format!("{:.3}", transferred.elapsed.as_secs_f64()),
            transferred.md5.clone(),
            String::new(),
        ]);
    }

    /// Row for a failed file
    pub fn failure(&mut self, item: &str, file: &FileDescriptor, error: &TransferError) {
        self.write_row(&[
            Utc::now().to_rfc3339(),
            item.to_string(),
            file.name.clone(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            error.to_string(),
        ]);
    }

    fn write_row(&mut self, fields: &[String; 8]) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };

        let line = fields
            .iter()
            .map(|f| sanitize_field(f))
            .collect::<Vec<_>>()
            .join("\t");

        let written = writeln!(sink, "{}", line).and_then(|_| sink.flush());
        if let Err(e) = written {
            tracing::warn!(error = %e, "Failed to write transfer log; disabling it");
            self.sink = None;
        }
    }
}

/// Tabs and line breaks would break the row structure
fn sanitize_field(field: &str) -> String {
    field.replace(['\t', '\n', '\r'], " ")
}
