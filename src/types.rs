//! Core types for archive-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::TransferError;

/// One file of an item, as listed by the remote service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Path of the file relative to its item (may contain `/`)
    pub name: String,
    /// Listed size in bytes, if the service reports one
    pub size: Option<u64>,
    /// Listed MD5 digest (lowercase hex), if the service reports one
    pub md5: Option<String>,
}

impl FileDescriptor {
    /// Descriptor with no expected size or checksum
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
            md5: None,
        }
    }
}

/// Proof that an (item, file) pair was fully obtained
///
/// Written once, never updated. Deleting it forces a re-download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Item identifier
    pub item: String,
    /// File name within the item
    pub file: String,
    /// When the record was written
    pub completed_at: DateTime<Utc>,
    /// Verified size in bytes
    pub size: Option<u64>,
    /// Verified MD5 digest
    pub md5: Option<String>,
}

/// Successful result of a single transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transferred {
    /// Final on-disk location
    pub path: PathBuf,
    /// Bytes written
    pub size: u64,
    /// MD5 of the bytes written
    pub md5: String,
    /// Wall-clock duration of the transfer
    pub elapsed: Duration,
}

/// Result of one transfer worker invocation
pub type TransferOutcome = std::result::Result<Transferred, TransferError>;

/// Lifecycle of an item inside the scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Read from the input, not yet looked at
    Pending,
    /// Waiting for the file listing
    Resolving,
    /// Checking files against the completion cache
    Dispatching,
    /// Files handed to the worker pool, outcomes outstanding
    AwaitingWorkers,
    /// Every dispatched file succeeded
    Succeeded,
    /// Resolution failed or at least one file failed
    PartialFailure,
}

impl ItemState {
    /// Whether the item has reached a terminal state
    pub fn is_done(&self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::PartialFailure)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ItemState::Pending => "pending",
            ItemState::Resolving => "resolving",
            ItemState::Dispatching => "dispatching",
            ItemState::AwaitingWorkers => "awaiting_workers",
            ItemState::Succeeded => "done(success)",
            ItemState::PartialFailure => "done(partial-failure)",
        };
        f.write_str(label)
    }
}
