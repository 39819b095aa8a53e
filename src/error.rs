//! Error types for archive-dl
//!
//! Errors are split by the scope of damage they do to a run:
//! - [`ResolutionError`] fails a single item (its file listing could not be obtained)
//! - [`TransferError`] fails a single file (network, timeout, integrity, local disk)
//! - [`CacheError`] is fatal for the whole run; it surfaces through [`Error::Cache`]
//!
//! Item- and file-level errors never abort sibling work. They are folded into the
//! run report instead of being propagated with `?`.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for archive-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for archive-dl
///
/// Anything that reaches the caller as an `Error` ends the run. Per-item and
/// per-file failures are reported through [`crate::report::RunSummary`] instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "jobs")
        key: Option<String>,
    },

    /// The completion cache could not be opened, read or written
    #[error("completion cache error: {0}")]
    Cache(#[from] CacheError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a config key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Completion cache errors
///
/// Every variant is fatal: continuing without a trustworthy cache would either
/// re-download the whole collection or lose acknowledged completions.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Failed to open the cache database
    #[error("failed to open completion cache: {0}")]
    ConnectionFailed(String),

    /// Failed to run schema migrations
    #[error("failed to migrate completion cache: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("completion cache query failed: {0}")]
    QueryFailed(String),

    /// The store exists but fails its integrity check
    #[error("completion cache is corrupt: {0}")]
    Corrupt(String),
}

/// Item-level failure to obtain a file listing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// The remote service does not know the item
    #[error("item {item} not found")]
    NotFound {
        /// Item identifier
        item: String,
    },

    /// Network trouble or the service is temporarily unavailable
    #[error("transient error resolving {item}: {reason}")]
    Transient {
        /// Item identifier
        item: String,
        /// What went wrong
        reason: String,
    },

    /// The metadata response could not be understood
    #[error("malformed metadata for {item}: {reason}")]
    Malformed {
        /// Item identifier
        item: String,
        /// What could not be parsed
        reason: String,
    },

    /// The service refused access to the item's metadata
    #[error("access to {item} denied (HTTP {status})")]
    Denied {
        /// Item identifier
        item: String,
        /// HTTP status returned by the service
        status: u16,
    },
}

impl ResolutionError {
    /// Whether a later run could plausibly succeed where this one failed
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolutionError::Transient { .. })
    }
}

/// Downloaded content disagrees with the expected metadata
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    /// Byte count differs from the listed size
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    Size {
        /// Size from the file listing
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// MD5 digest differs from the listed checksum
    #[error("md5 mismatch: expected {expected}, got {actual}")]
    Checksum {
        /// Digest from the file listing
        expected: String,
        /// Digest of the received bytes
        actual: String,
    },
}

/// File-level transfer failure
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connection failure, reset, or a 5xx/429 response
    #[error("transient transfer error: {0}")]
    Transient(String),

    /// The per-file deadline or the per-chunk stall deadline passed
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered with a non-retryable HTTP status
    #[error("transfer rejected with HTTP {status}")]
    Rejected {
        /// HTTP status returned by the service
        status: u16,
    },

    /// Received bytes failed verification
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// The destination could not be written
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl TransferError {
    /// Short machine-friendly label, used in the transfer log and the run report
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Transient(_) => "transient",
            TransferError::Timeout(_) => "timeout",
            TransferError::Rejected { .. } => "rejected",
            TransferError::Integrity(_) => "integrity",
            TransferError::Storage(_) => "storage",
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => classify_transfer_status(status.as_u16()),
            None => TransferError::Transient(e.to_string()),
        }
    }
}

/// Map a non-success HTTP status on the download endpoint to a transfer error
pub(crate) fn classify_transfer_status(status: u16) -> TransferError {
    match status {
        408 | 429 | 500..=599 => TransferError::Transient(format!("HTTP {status}")),
        _ => TransferError::Rejected { status },
    }
}
