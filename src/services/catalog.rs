//! Durable mirror of the index in SQLite.
//!
//! The in-memory index stays authoritative while the process runs. The
//! catalog is written after each committed mutation so the index can be
//! rebuilt on the next start; see `reconcile` for how the two are brought
//! back in line with the blob directory.

use super::{blob_store::BlobInfo, error::StorageResult};
use crate::models::object::{BlobId, ObjectRecord};
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, info};
use uuid::Uuid;

const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

#[derive(FromRow)]
struct ObjectRow {
    bucket: String,
    key: String,
    id: Uuid,
    filename: String,
    content_type: Option<String>,
    size_bytes: i64,
    etag: String,
    position: i64,
    last_modified: DateTime<Utc>,
}

impl ObjectRow {
    fn into_record(self) -> (String, ObjectRecord) {
        let blob = BlobId::for_object(&self.bucket, &self.key);
        let record = ObjectRecord {
            id: self.id,
            key: self.key,
            filename: self.filename,
            content_type: self.content_type,
            size: self.size_bytes.max(0) as u64,
            etag: self.etag,
            blob,
            position: self.position,
            last_modified: self.last_modified,
        };
        (self.bucket, record)
    }
}

/// Everything the catalog knows, in listing order.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    /// Bucket names in first-insertion order, including empty buckets.
    pub buckets: Vec<String>,
    /// `(bucket, record)` pairs in per-bucket insertion order.
    pub objects: Vec<(String, ObjectRecord)>,
}

#[derive(Clone)]
pub struct Catalog {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl Catalog {
    /// Connect to `database_url`, creating the database file if needed,
    /// and apply the schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `:memory:` is its own database.
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(Arc::new(pool)).await
    }

    pub async fn from_pool(db: Arc<SqlitePool>) -> StorageResult<Self> {
        let catalog = Self { db };
        catalog.migrate().await?;
        Ok(catalog)
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StorageResult<usize> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    pub async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    /// Insert or overwrite the row for `(bucket, record.key)`.
    ///
    /// `record.position` comes from the index and is stored as is.
    pub async fn upsert(&self, bucket: &str, record: &ObjectRecord) -> StorageResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO buckets (name, created_at) VALUES (?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(bucket)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO objects (
                bucket, key, id, filename, content_type, size_bytes,
                etag, position, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                id = excluded.id,
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                position = excluded.position,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(bucket)
        .bind(&record.key)
        .bind(record.id)
        .bind(&record.filename)
        .bind(record.content_type.as_deref())
        .bind(record.size as i64)
        .bind(&record.etag)
        .bind(record.position)
        .bind(record.last_modified)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Remove the row for `(bucket, key)`. The bucket row is kept.
    pub async fn remove(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Overwrite size and etag with values measured from the blob on disk.
    pub async fn set_blob_info(&self, bucket: &str, key: &str, info: &BlobInfo) -> StorageResult<()> {
        sqlx::query("UPDATE objects SET size_bytes = ?, etag = ? WHERE bucket = ? AND key = ?")
            .bind(info.size as i64)
            .bind(&info.etag)
            .bind(bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn load(&self) -> StorageResult<CatalogSnapshot> {
        let buckets: Vec<String> = sqlx::query_scalar("SELECT name FROM buckets ORDER BY rowid")
            .fetch_all(&*self.db)
            .await?;

        let rows: Vec<ObjectRow> = sqlx::query_as(
            "SELECT bucket, key, id, filename, content_type, size_bytes, etag, position, last_modified
             FROM objects
             ORDER BY bucket, position",
        )
        .fetch_all(&*self.db)
        .await?;

        let objects = rows.into_iter().map(ObjectRow::into_record).collect::<Vec<_>>();
        info!(
            buckets = buckets.len(),
            objects = objects.len(),
            "loaded catalog"
        );
        Ok(CatalogSnapshot { buckets, objects })
    }
}
