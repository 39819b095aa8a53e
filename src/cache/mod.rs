//! Completion cache for archive-dl
//!
//! A SQLite database recording which (item, file) pairs have been fully
//! transferred and verified. It lives outside the destination tree, one file per
//! collection, and is the only thing the scheduler consults to decide whether a
//! file still needs downloading.
//!
//! ## Submodules
//!
//! Methods on [`CompletionCache`] are organized by domain:
//! - [`migrations`]: open/close lifecycle, integrity check, schema migrations
//! - [`completions`]: completion record lookups and appends
//! - [`listings`]: optional cache of item file listings
//!
//! ## Durability
//!
//! The pool holds a single connection, so writes are serialized by the pool
//! itself and callers may append from any number of tasks. The journal runs in
//! WAL mode with `synchronous=FULL`: once [`CompletionCache::mark_complete`]
//! returns, the record survives a crash of the process.

use sqlx::{FromRow, sqlite::SqlitePool};

mod completions;
mod listings;
mod migrations;

/// Completion record row (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct CompletionRow {
    /// Item identifier
    pub item: String,
    /// File name within the item
    pub file: String,
    /// Verified size in bytes
    pub size_bytes: Option<i64>,
    /// Verified MD5 digest
    pub md5: Option<String>,
    /// Unix timestamp when the record was written
    pub completed_at: i64,
}

impl From<CompletionRow> for crate::types::CompletionRecord {
    fn from(row: CompletionRow) -> Self {
        use chrono::{TimeZone, Utc};

        crate::types::CompletionRecord {
            item: row.item,
            file: row.file,
            completed_at: Utc
                .timestamp_opt(row.completed_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
            size: row.size_bytes.map(|s| s as u64),
            md5: row.md5,
        }
    }
}

/// Handle to the completion cache
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct CompletionCache {
    pool: SqlitePool,
}
