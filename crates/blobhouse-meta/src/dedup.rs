//! Durable dedup table on SQLite.

use crate::database::SqliteDatabase;
use crate::error::{MetaError, MetaResult};
use async_trait::async_trait;
use blobhouse_core::{
    BlobUri, ContentHash, DedupEntry, DedupRegistration, DedupTable, TransformChain, VaultResult,
};
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, sqlx::FromRow)]
struct DedupRow {
    hash: String,
    uri: String,
    chain_json: Vec<u8>,
}

impl DedupRow {
    fn into_entry(self) -> VaultResult<DedupEntry> {
        Ok(DedupEntry {
            content_hash: ContentHash::from_hex(&self.hash)
                .map_err(|e| MetaError::CorruptRow(e.to_string()))?,
            uri: self
                .uri
                .parse()
                .map_err(|e: blobhouse_core::VaultError| MetaError::CorruptRow(e.to_string()))?,
            chain: TransformChain::decode(&self.chain_json)?,
        })
    }
}

/// Dedup table stored in the `dedup` table of the shared database.
pub struct SqliteDedupTable {
    db: Arc<SqliteDatabase>,
}

impl SqliteDedupTable {
    /// Table over `db`.
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self { db }
    }

    async fn fetch(&self, hash: &str) -> MetaResult<Option<DedupRow>> {
        let pool = self.db.pool()?;
        Ok(
            sqlx::query_as("SELECT hash, uri, chain_json FROM dedup WHERE hash = ?")
                .bind(hash)
                .fetch_optional(&pool)
                .await?,
        )
    }
}

#[async_trait]
impl DedupTable for SqliteDedupTable {
    fn backend_name(&self) -> &str {
        "sqlite"
    }

    async fn open(&self) -> VaultResult<()> {
        Ok(self.db.open().await?)
    }

    async fn health(&self) -> VaultResult<()> {
        Ok(self.db.health().await?)
    }

    async fn try_get_existing(&self, hash: &ContentHash) -> VaultResult<Option<DedupEntry>> {
        self.fetch(&hash.to_hex())
            .await?
            .map(DedupRow::into_entry)
            .transpose()
    }

    async fn register(&self, entry: DedupEntry) -> VaultResult<DedupRegistration> {
        let hash = entry.content_hash.to_hex();
        let chain = entry.chain.encode()?;
        let pool = self.db.pool()?;
        let mut tx = pool.begin().await.map_err(MetaError::from)?;
        let inserted = sqlx::query(
            "INSERT INTO dedup (hash, uri, chain_json, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(hash) DO NOTHING",
        )
        .bind(&hash)
        .bind(entry.uri.to_string())
        .bind(chain)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(MetaError::from)?
        .rows_affected()
            == 1;
        let canonical: DedupRow =
            sqlx::query_as("SELECT hash, uri, chain_json FROM dedup WHERE hash = ?")
                .bind(&hash)
                .fetch_one(&mut *tx)
                .await
                .map_err(MetaError::from)?;
        tx.commit().await.map_err(MetaError::from)?;

        if inserted {
            Ok(DedupRegistration::Inserted(entry))
        } else {
            Ok(DedupRegistration::Existing(canonical.into_entry()?))
        }
    }

    async fn unregister(&self, hash: &ContentHash, uri: &BlobUri) -> VaultResult<bool> {
        let pool = self.db.pool()?;
        let done = sqlx::query("DELETE FROM dedup WHERE hash = ? AND uri = ?")
            .bind(hash.to_hex())
            .bind(uri.to_string())
            .execute(&pool)
            .await
            .map_err(MetaError::from)?;
        Ok(done.rows_affected() > 0)
    }

    async fn entries(&self) -> VaultResult<Vec<DedupEntry>> {
        let pool = self.db.pool()?;
        let rows: Vec<DedupRow> = sqlx::query_as("SELECT hash, uri, chain_json FROM dedup")
            .fetch_all(&pool)
            .await
            .map_err(MetaError::from)?;
        rows.into_iter().map(DedupRow::into_entry).collect()
    }

    async fn len(&self) -> VaultResult<usize> {
        let pool = self.db.pool()?;
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dedup")
            .fetch_one(&pool)
            .await
            .map_err(MetaError::from)?;
        Ok(n as usize)
    }
}
