//! Cache lifecycle, integrity check and schema migrations.

use crate::error::CacheError;
use crate::{Error, Result};
use sqlx::{Connection, SqliteConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;

use super::CompletionCache;

/// Latest schema version known to this build
const SCHEMA_VERSION: i64 = 2;

/// How long a writer waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

fn migration_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Cache(CacheError::MigrationFailed(format!("{context}: {e}")))
}

/// SQLite reports a garbage file lazily, on the first statement it runs
fn classify_open_error(e: sqlx::Error) -> Error {
    let msg = e.to_string();
    if msg.contains("not a database") || msg.contains("malformed") {
        Error::Cache(CacheError::Corrupt(msg))
    } else {
        Error::Cache(CacheError::ConnectionFailed(msg))
    }
}

impl CompletionCache {
    /// Open (or create) the cache at `path`
    ///
    /// Creates the parent directory and the database file if needed, verifies the
    /// store with `PRAGMA quick_check`, and runs pending migrations. Any failure is
    /// a [`CacheError`]; an existing but unreadable file is never replaced.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Cache(CacheError::ConnectionFailed(format!(
                    "Failed to create cache directory {}: {}",
                    parent.display(),
                    e
                )))
            })?;
        }

        // Path taken as a file name, never parsed as a URL
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);

        // One connection: every write is serialized by the pool
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(classify_open_error)?;

        let cache = Self { pool };
        cache.check_integrity().await?;
        cache.run_migrations().await?;

        tracing::debug!(path = %path.display(), "Completion cache opened");
        Ok(cache)
    }

    /// Flush the write-ahead log into the main database file and release the store
    pub async fn close(self) {
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %e, "Failed to checkpoint completion cache");
        }
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &sqlx::sqlite::SqlitePool {
        &self.pool
    }

    async fn check_integrity(&self) -> Result<()> {
        let rows: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_all(&self.pool)
            .await
            .map_err(classify_open_error)?;

        match rows.first().map(String::as_str) {
            Some("ok") => Ok(()),
            Some(_) => Err(Error::Cache(CacheError::Corrupt(rows.join("; ")))),
            None => Err(Error::Cache(CacheError::Corrupt(
                "integrity check returned no result".to_string(),
            ))),
        }
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Cache(CacheError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(migration_failed("Failed to create schema_version table"))?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Cache(CacheError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?;

        let current_version = current_version.unwrap_or(0);

        for version in (current_version + 1)..=SCHEMA_VERSION {
            Self::apply(&mut conn, version as i32).await?;
        }

        Ok(())
    }

    /// Apply one migration inside a transaction so a partial failure leaves no trace
    async fn apply(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        tracing::info!(version, "Applying completion cache migration");

        // Rolled back on drop unless committed
        let mut tx = conn
            .begin()
            .await
            .map_err(migration_failed("Failed to begin transaction"))?;

        match version {
            1 => Self::create_completions_schema(&mut tx).await?,
            2 => Self::create_listings_schema(&mut tx).await?,
            other => {
                return Err(Error::Cache(CacheError::MigrationFailed(format!(
                    "unknown migration v{other}"
                ))));
            }
        }
        Self::record_migration(&mut tx, version).await?;

        tx.commit()
            .await
            .map_err(migration_failed("Failed to commit migration"))?;

        Ok(())
    }

    /// v1: completion records
    async fn create_completions_schema(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE completions (
                item TEXT NOT NULL,
                file TEXT NOT NULL,
                size_bytes INTEGER,
                md5 TEXT,
                completed_at INTEGER NOT NULL,
                PRIMARY KEY (item, file)
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(migration_failed("Failed to create completions table"))?;

        Ok(())
    }

    /// v2: cached item file listings
    async fn create_listings_schema(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE listings (
                item TEXT PRIMARY KEY,
                files_json TEXT NOT NULL,
                fetched_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(migration_failed("Failed to create listings table"))?;

        Ok(())
    }

    /// Record a migration version
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(migration_failed("Failed to record migration"))?;

        Ok(())
    }
}
