//! Cached item file listings.
//!
//! Listings are stored unfiltered so one cache serves any filter.

use crate::error::CacheError;
use crate::types::FileDescriptor;
use crate::{Error, Result};

use super::CompletionCache;

impl CompletionCache {
    /// Cached listing of an item, if one was stored
    ///
    /// A row that no longer deserializes is treated as absent.
    pub async fn cached_listing(&self, item: &str) -> Result<Option<Vec<FileDescriptor>>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT files_json FROM listings WHERE item = ?")
                .bind(item)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    Error::Cache(CacheError::QueryFailed(format!(
                        "Failed to read cached listing of {}: {}",
                        item, e
                    )))
                })?;

        let Some(json) = json else {
            return Ok(None);
        };

        match serde_json::from_str(&json) {
            Ok(files) => Ok(Some(files)),
            Err(e) => {
                tracing::warn!(item = %item, error = %e, "Ignoring unreadable cached listing");
                Ok(None)
            }
        }
    }

    /// Store (or replace) the listing of an item
    pub async fn store_listing(&self, item: &str, files: &[FileDescriptor]) -> Result<()> {
        let json = serde_json::to_string(files)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO listings (item, files_json, fetched_at)
            VALUES (?, ?, ?)
            ON CONFLICT(item) DO UPDATE SET files_json = excluded.files_json,
                                            fetched_at = excluded.fetched_at
            "#,
        )
        .bind(item)
        .bind(json)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Cache(CacheError::QueryFailed(format!(
                "Failed to store listing of {}: {}",
                item, e
            )))
        })?;

        Ok(())
    }
}
