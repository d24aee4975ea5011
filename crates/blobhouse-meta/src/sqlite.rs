//! Durable metadata index on SQLite.
//!
//! Header fields are plain columns; the chain sits in its own `chain_json` column and is only
//! selected by `get`. Timestamps are stored as Unix milliseconds.

use crate::database::SqliteDatabase;
use crate::error::{MetaError, MetaResult};
use async_trait::async_trait;
use blobhouse_core::{
    BlobHeader, BlobMetadata, BlobUri, ContentHash, MetadataIndex, Plugin, PluginCategory,
    PluginDescriptor, TransformChain, VaultResult,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Plugin id of the SQLite index.
pub const SQLITE_INDEX_ID: &str = "index-sqlite";

const HEADER_COLUMNS: &str =
    "bucket, key, content_hash, size, uri, owner, created_at, modified_at, trace_id";

#[derive(Debug, sqlx::FromRow)]
struct HeaderRow {
    bucket: String,
    key: String,
    content_hash: String,
    size: i64,
    uri: String,
    owner: String,
    created_at: i64,
    modified_at: i64,
    trace_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct BlobRow {
    #[sqlx(flatten)]
    header: HeaderRow,
    chain_json: Vec<u8>,
}

pub(crate) fn from_millis(ms: i64) -> MetaResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| MetaError::CorruptRow(format!("timestamp {ms} out of range")))
}

impl HeaderRow {
    fn into_header(self) -> MetaResult<BlobHeader> {
        Ok(BlobHeader {
            content_hash: ContentHash::from_hex(&self.content_hash)
                .map_err(|e| MetaError::CorruptRow(e.to_string()))?,
            size: u64::try_from(self.size)
                .map_err(|_| MetaError::CorruptRow(format!("negative size {}", self.size)))?,
            uri: self
                .uri
                .parse::<BlobUri>()
                .map_err(|e| MetaError::CorruptRow(e.to_string()))?,
            created_at: from_millis(self.created_at)?,
            modified_at: from_millis(self.modified_at)?,
            trace_id: Uuid::parse_str(&self.trace_id)
                .map_err(|e| MetaError::CorruptRow(format!("trace id: {e}")))?,
            bucket: self.bucket,
            key: self.key,
            owner: self.owner,
        })
    }
}

/// Metadata index persisted in the shared SQLite database.
pub struct SqliteMetadataIndex {
    descriptor: PluginDescriptor,
    db: Arc<SqliteDatabase>,
}

impl SqliteMetadataIndex {
    /// Index over `db`. The database is opened by [`MetadataIndex::open`] if still closed.
    pub fn new(db: Arc<SqliteDatabase>) -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                SQLITE_INDEX_ID,
                "SQLite metadata index",
                "1.0.0",
                PluginCategory::Metadata,
            )
            .with_tags(["metadata", "durable"]),
            db,
        }
    }

    /// Shared database handle.
    pub fn database(&self) -> &Arc<SqliteDatabase> {
        &self.db
    }
}

impl Plugin for SqliteMetadataIndex {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    fn is_durable(&self) -> bool {
        true
    }

    async fn open(&self) -> VaultResult<()> {
        Ok(self.db.open().await?)
    }

    async fn health(&self) -> VaultResult<()> {
        Ok(self.db.health().await?)
    }

    async fn put(&self, metadata: &BlobMetadata) -> VaultResult<()> {
        let chain = metadata.chain.encode()?;
        let h = &metadata.header;
        let pool = self.db.pool()?;
        sqlx::query(
            "INSERT INTO blobs (bucket, key, content_hash, size, uri, owner, created_at, modified_at, trace_id, chain_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, key) DO UPDATE SET
                content_hash = excluded.content_hash,
                size = excluded.size,
                uri = excluded.uri,
                owner = excluded.owner,
                modified_at = excluded.modified_at,
                trace_id = excluded.trace_id,
                chain_json = excluded.chain_json",
        )
        .bind(&h.bucket)
        .bind(&h.key)
        .bind(h.content_hash.to_hex())
        .bind(h.size as i64)
        .bind(h.uri.to_string())
        .bind(&h.owner)
        .bind(h.created_at.timestamp_millis())
        .bind(h.modified_at.timestamp_millis())
        .bind(h.trace_id.to_string())
        .bind(chain)
        .execute(&pool)
        .await
        .map_err(MetaError::from)?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> VaultResult<Option<BlobMetadata>> {
        let pool = self.db.pool()?;
        let row: Option<BlobRow> = sqlx::query_as(&format!(
            "SELECT {HEADER_COLUMNS}, chain_json FROM blobs WHERE bucket = ? AND key = ?"
        ))
        .bind(bucket)
        .bind(key)
        .fetch_optional(&pool)
        .await
        .map_err(MetaError::from)?;
        match row {
            Some(row) => Ok(Some(BlobMetadata {
                chain: TransformChain::decode(&row.chain_json)?,
                header: row.header.into_header()?,
            })),
            None => Ok(None),
        }
    }

    async fn get_header(&self, bucket: &str, key: &str) -> VaultResult<Option<BlobHeader>> {
        let pool = self.db.pool()?;
        let row: Option<HeaderRow> = sqlx::query_as(&format!(
            "SELECT {HEADER_COLUMNS} FROM blobs WHERE bucket = ? AND key = ?"
        ))
        .bind(bucket)
        .bind(key)
        .fetch_optional(&pool)
        .await
        .map_err(MetaError::from)?;
        Ok(row.map(HeaderRow::into_header).transpose()?)
    }

    async fn exists(&self, bucket: &str, key: &str) -> VaultResult<bool> {
        let pool = self.db.pool()?;
        let hit: Option<i64> = sqlx::query_scalar("SELECT 1 FROM blobs WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .fetch_optional(&pool)
            .await
            .map_err(MetaError::from)?;
        Ok(hit.is_some())
    }

    async fn remove(&self, bucket: &str, key: &str) -> VaultResult<bool> {
        let pool = self.db.pool()?;
        let done = sqlx::query("DELETE FROM blobs WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&pool)
            .await
            .map_err(MetaError::from)?;
        Ok(done.rows_affected() > 0)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> VaultResult<Vec<BlobHeader>> {
        let pool = self.db.pool()?;
        let rows: Vec<HeaderRow> = sqlx::query_as(&format!(
            "SELECT {HEADER_COLUMNS} FROM blobs
             WHERE bucket = ? AND substr(key, 1, ?) = ?
             ORDER BY key"
        ))
        .bind(bucket)
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&pool)
        .await
        .map_err(MetaError::from)?;
        Ok(rows
            .into_iter()
            .map(HeaderRow::into_header)
            .collect::<MetaResult<Vec<_>>>()?)
    }

    async fn referenced_uris(&self) -> VaultResult<HashSet<BlobUri>> {
        let pool = self.db.pool()?;
        let uris: Vec<String> = sqlx::query_scalar("SELECT DISTINCT uri FROM blobs")
            .fetch_all(&pool)
            .await
            .map_err(MetaError::from)?;
        Ok(uris
            .into_iter()
            .map(|u| u.parse::<BlobUri>().map_err(|e| MetaError::CorruptRow(e.to_string())))
            .collect::<MetaResult<HashSet<_>>>()?)
    }
}
