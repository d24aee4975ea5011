//! Shared SQLite handle used by the durable index and dedup table.
//!
//! The engine opens the database before any store that uses it and closes it after them.

use crate::error::{MetaError, MetaResult};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS blobs (
        bucket TEXT NOT NULL,
        key TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        size INTEGER NOT NULL,
        uri TEXT NOT NULL,
        owner TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        modified_at INTEGER NOT NULL,
        trace_id TEXT NOT NULL,
        chain_json BLOB NOT NULL,
        PRIMARY KEY (bucket, key)
    )",
    "CREATE INDEX IF NOT EXISTS idx_blobs_uri ON blobs(uri)",
    "CREATE TABLE IF NOT EXISTS dedup (
        hash TEXT PRIMARY KEY,
        uri TEXT NOT NULL,
        chain_json BLOB NOT NULL,
        created_at INTEGER NOT NULL
    )",
];

/// Lazily opened SQLite pool.
#[derive(Debug)]
pub struct SqliteDatabase {
    path: PathBuf,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteDatabase {
    /// Handle for the database file at `path`; nothing is opened yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: RwLock::new(None),
        }
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True between `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Connect and migrate. Idempotent.
    pub async fn open(&self) -> MetaResult<()> {
        if self.is_open() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", self.path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // Single connection: SQLite has one writer and dedup transactions rely on it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        migrate(&pool).await?;

        let mut slot = self.pool.write();
        if slot.is_none() {
            *slot = Some(pool);
            info!(path = %self.path.display(), "metadata database opened");
        }
        Ok(())
    }

    /// Close the pool. Idempotent.
    pub async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(path = %self.path.display(), "metadata database closed");
        }
    }

    /// Pool handle; [`MetaError::NotOpen`] outside open/close.
    pub fn pool(&self) -> MetaResult<SqlitePool> {
        self.pool.read().clone().ok_or(MetaError::NotOpen)
    }

    /// Round trip a trivial query.
    pub async fn health(&self) -> MetaResult<()> {
        let pool = self.pool()?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }
}

async fn migrate(pool: &SqlitePool) -> MetaResult<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await?;
    }
    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_meta WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    match version {
        None => {
            sqlx::query("INSERT INTO schema_meta (id, version) VALUES (1, ?)")
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await?;
            debug!(version = SCHEMA_VERSION, "schema initialized");
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(MetaError::Schema(format!(
                "database schema version {v}, this build understands {SCHEMA_VERSION}"
            )));
        }
    }
    Ok(())
}
