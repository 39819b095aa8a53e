//! Completion record lookups and appends.

use crate::error::CacheError;
use crate::types::CompletionRecord;
use crate::{Error, Result};

use super::{CompletionCache, CompletionRow};

impl CompletionCache {
    /// Check whether `file` of `item` has a completion record
    pub async fn is_complete(&self, item: &str, file: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM completions WHERE item = ? AND file = ?
            "#,
        )
        .bind(item)
        .bind(file)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Cache(CacheError::QueryFailed(format!(
                "Failed to look up completion of {}/{}: {}",
                item, file, e
            )))
        })?;

        Ok(count > 0)
    }

    /// Record that `file` of `item` was fully transferred
    ///
    /// Idempotent: if a record already exists it is left untouched and this call
    /// succeeds. Returns only after the record is durable.
    pub async fn mark_complete(
        &self,
        item: &str,
        file: &str,
        size: Option<u64>,
        md5: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO completions (item, file, size_bytes, md5, completed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(item, file) DO NOTHING
            "#,
        )
        .bind(item)
        .bind(file)
        .bind(size.map(|s| s as i64))
        .bind(md5)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Cache(CacheError::QueryFailed(format!(
                "Failed to record completion of {}/{}: {}",
                item, file, e
            )))
        })?;

        Ok(())
    }

    /// Fetch the completion record of a single file
    pub async fn get_completion(&self, item: &str, file: &str) -> Result<Option<CompletionRecord>> {
        let row: Option<CompletionRow> = sqlx::query_as(
            r#"
            SELECT item, file, size_bytes, md5, completed_at
            FROM completions
            WHERE item = ? AND file = ?
            "#,
        )
        .bind(item)
        .bind(file)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Cache(CacheError::QueryFailed(format!(
                "Failed to fetch completion of {}/{}: {}",
                item, file, e
            )))
        })?;

        Ok(row.map(CompletionRecord::from))
    }

    /// All completion records of an item, ordered by file name
    pub async fn completed_files(&self, item: &str) -> Result<Vec<CompletionRecord>> {
        let rows: Vec<CompletionRow> = sqlx::query_as(
            r#"
            SELECT item, file, size_bytes, md5, completed_at
            FROM completions
            WHERE item = ?
            ORDER BY file ASC
            "#,
        )
        .bind(item)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Cache(CacheError::QueryFailed(format!(
                "Failed to list completions of {}: {}",
                item, e
            )))
        })?;

        Ok(rows.into_iter().map(CompletionRecord::from).collect())
    }

    /// Total number of completion records
    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM completions")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Cache(CacheError::QueryFailed(format!(
                    "Failed to count completions: {}",
                    e
                )))
            })?;

        Ok(count as u64)
    }

    /// Delete a completion record so the next run downloads the file again
    ///
    /// Returns whether a record existed.
    pub async fn forget(&self, item: &str, file: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM completions WHERE item = ? AND file = ?")
            .bind(item)
            .bind(file)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Cache(CacheError::QueryFailed(format!(
                    "Failed to forget completion of {}/{}: {}",
                    item, file, e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
