//! src/services/storage_service.rs
//!
//! StorageService coordinates the in-memory index with on-disk blobs.
//!
//! Every mutation runs under the per-object key lock and follows one order:
//! stage bytes, check the index, promote the blob, commit the index, write
//! the catalog. A failure before promotion leaves both sides untouched; a
//! failure after promotion deletes the promoted blob again. The index never
//! points at a blob that is not fully on disk.
//!
//! A create is only acknowledged once its catalog row exists, so a restart
//! cannot quarantine it. Replace and delete keep the blob directory as the
//! source of truth: a failed catalog write there is logged and reconciled
//! on the next start (sizes re-measured, dangling rows dropped).

use super::{
    blob_store::BlobStore,
    catalog::Catalog,
    error::{StorageError, StorageResult},
    index::Index,
    key_locks::KeyLocks,
    reconcile::{OrphanPolicy, reconcile},
};
use crate::models::object::{BlobId, ObjectRecord, UploadMeta};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::{io, path::PathBuf, sync::Arc};
use tokio::fs::File;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_BUCKET_NAME_LEN: usize = 255;

/// Progress of a single mutating request, emitted as a `phase` debug field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    Staged,
    Promoted,
    Committed,
    Aborted,
    IndexFailed,
    CatalogFailed,
    Compensated,
}

fn enter(phase: Phase) {
    debug!(?phase, "mutation phase");
}

/// Result of a successful delete.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// Record and blob were both removed.
    Removed(ObjectRecord),
    /// The blob was already gone; the record was removed anyway.
    DanglingRecordRemoved(ObjectRecord),
}

impl DeleteOutcome {
    pub fn record(&self) -> &ObjectRecord {
        match self {
            Self::Removed(record) | Self::DanglingRecordRemoved(record) => record,
        }
    }
}

/// StorageService provides the object operations:
/// - list buckets / list objects / get object (index reads)
/// - open an object for streaming its bytes
/// - create, replace and delete objects (index + blob store as one unit)
///
/// Cloning is cheap; all clones share the same index, blob store and locks.
#[derive(Clone)]
pub struct StorageService {
    index: Arc<Index>,
    blobs: Arc<BlobStore>,
    locks: Arc<KeyLocks>,
    catalog: Option<Catalog>,
}

impl StorageService {
    pub fn new(index: Arc<Index>, blobs: BlobStore, catalog: Option<Catalog>) -> Self {
        Self {
            index,
            blobs: Arc::new(blobs),
            locks: Arc::new(KeyLocks::new()),
            catalog,
        }
    }

    /// Open the blob store under `storage_dir` and build the index.
    ///
    /// With a catalog the index is restored and reconciled against the blob
    /// directory; without one it starts empty. Leftover staged uploads are
    /// removed either way.
    pub async fn open(
        storage_dir: impl Into<PathBuf>,
        catalog: Option<Catalog>,
        orphan_policy: OrphanPolicy,
    ) -> StorageResult<Self> {
        let blobs = BlobStore::open(storage_dir).await?;
        let index = Arc::new(Index::new());
        match &catalog {
            Some(catalog) => {
                reconcile(&index, &blobs, catalog, orphan_policy).await?;
            }
            None => {
                let swept = blobs.sweep_staging().await?;
                info!(swept, "starting with an empty in-memory index");
                let leftover = blobs.list_blob_ids().await?.len();
                if leftover > 0 {
                    warn!(
                        leftover,
                        "blobs from an earlier run are unreachable without a catalog"
                    );
                }
            }
        }
        Ok(Self::new(index, blobs, catalog))
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn catalog(&self) -> Option<&Catalog> {
        self.catalog.as_ref()
    }

    /// Keys are opaque, but must be non-empty, bounded, and free of
    /// control characters.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.chars().any(char::is_control) {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let reason = if name.is_empty() {
            "must not be empty"
        } else if name.len() > MAX_BUCKET_NAME_LEN {
            "must be at most 255 bytes"
        } else if name.chars().any(char::is_control) {
            "must not contain control characters"
        } else {
            return Ok(());
        };
        Err(StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        })
    }

    fn ensure_names_safe(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.ensure_bucket_name_safe(bucket)?;
        self.ensure_key_safe(key)
    }

    pub fn list_buckets(&self) -> Vec<String> {
        self.index.list_buckets()
    }

    pub fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ObjectRecord>> {
        self.ensure_bucket_name_safe(bucket)?;
        self.index.list_objects(bucket)
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectRecord> {
        self.ensure_names_safe(bucket, key)?;
        self.index.get_object(bucket, key)
    }

    /// Fetch an object for reading.
    ///
    /// The record lookup and the file open happen under the key lock, so the
    /// returned handle always holds the bytes the record describes, even if
    /// a replace lands while the caller is still streaming.
    #[tracing::instrument(skip(self), fields(bucket = %bucket, key = %key))]
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(ObjectRecord, File)> {
        self.ensure_names_safe(bucket, key)?;
        let blob = BlobId::for_object(bucket, key);
        let _guard = self.locks.lock(&blob).await;

        let record = self.index.get_object(bucket, key)?;
        match self.blobs.read(&record.blob).await {
            Ok(file) => Ok((record, file)),
            Err(StorageError::BlobNotFound(blob)) => {
                let err = StorageError::IndexInconsistent {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    blob,
                };
                error!(error = %err, "index references a missing blob");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Create a new object from a byte stream.
    ///
    /// Fails with `ObjectAlreadyExists` if the key is taken, including when a
    /// concurrent create of the same key wins the race; the loser's bytes
    /// never reach the canonical location.
    #[tracing::instrument(skip(self, upload, stream), fields(bucket = %bucket, key = %key))]
    pub async fn create_object<S>(
        &self,
        bucket: &str,
        key: &str,
        upload: UploadMeta,
        stream: S,
    ) -> StorageResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_names_safe(bucket, key)?;
        enter(Phase::Received);
        let staged = self
            .blobs
            .stage(stream)
            .await
            .inspect_err(|_| enter(Phase::Aborted))?;
        enter(Phase::Staged);

        let blob = BlobId::for_object(bucket, key);
        let _guard = self.locks.lock(&blob).await;
        if self.index.contains(bucket, key) {
            enter(Phase::Aborted);
            return Err(StorageError::already_exists(bucket, key));
        }

        let info = self
            .blobs
            .promote(staged, &blob)
            .await
            .inspect_err(|_| enter(Phase::Aborted))?;
        enter(Phase::Promoted);

        let record = ObjectRecord {
            id: Uuid::new_v4(),
            key: key.to_string(),
            filename: upload.filename.unwrap_or_else(|| key.to_string()),
            content_type: upload.content_type,
            size: info.size,
            etag: info.etag,
            blob,
            position: 0,
            last_modified: Utc::now(),
        };
        // The key lock and the check above make this unreachable in
        // practice; it still must not leave a promoted blob behind.
        let record = match self.index.insert_object(bucket, key, record) {
            Ok(stored) => stored,
            Err(err) => {
                enter(Phase::IndexFailed);
                self.compensate(&BlobId::for_object(bucket, key)).await;
                enter(Phase::Compensated);
                return Err(err);
            }
        };

        if let Some(catalog) = &self.catalog {
            if let Err(err) = catalog.upsert(bucket, &record).await {
                enter(Phase::CatalogFailed);
                error!(error = %err, "failed to persist new object, rolling back");
                if let Err(rollback) = self.index.remove_object(bucket, key) {
                    error!(error = %rollback, "failed to roll back index insert");
                }
                self.compensate(&record.blob).await;
                enter(Phase::Compensated);
                return Err(err);
            }
        }
        enter(Phase::Committed);
        info!(size = record.size, "object created");
        Ok(record)
    }

    /// Replace the bytes and display metadata of an existing object.
    ///
    /// The old bytes stay at the canonical location until the new blob is
    /// renamed over them, so any failure before that leaves the object as it
    /// was. Key, id and list position are preserved.
    #[tracing::instrument(skip(self, upload, stream), fields(bucket = %bucket, key = %key))]
    pub async fn replace_object<S>(
        &self,
        bucket: &str,
        key: &str,
        upload: UploadMeta,
        stream: S,
    ) -> StorageResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_names_safe(bucket, key)?;
        enter(Phase::Received);
        let staged = self
            .blobs
            .stage(stream)
            .await
            .inspect_err(|_| enter(Phase::Aborted))?;
        enter(Phase::Staged);

        let blob = BlobId::for_object(bucket, key);
        let _guard = self.locks.lock(&blob).await;
        let previous = self
            .index
            .get_object(bucket, key)
            .inspect_err(|_| enter(Phase::Aborted))?;

        let info = self
            .blobs
            .promote(staged, &blob)
            .await
            .inspect_err(|_| enter(Phase::Aborted))?;
        enter(Phase::Promoted);

        let record = ObjectRecord {
            id: previous.id,
            key: key.to_string(),
            filename: upload.filename.unwrap_or(previous.filename),
            content_type: upload.content_type,
            size: info.size,
            etag: info.etag,
            blob,
            position: previous.position,
            last_modified: Utc::now(),
        };
        // Unreachable while the key lock is held: only a delete of this key
        // could remove the record.
        if let Err(err) = self.index.replace_object(bucket, key, record.clone()) {
            enter(Phase::IndexFailed);
            self.compensate(&record.blob).await;
            enter(Phase::Compensated);
            return Err(err);
        }

        self.mirror_upsert(bucket, &record).await;
        enter(Phase::Committed);
        info!(size = record.size, "object replaced");
        Ok(record)
    }

    /// Delete an object and its blob.
    ///
    /// A blob that is already missing does not block the delete: the record
    /// is removed, the inconsistency is logged, and the outcome says so.
    #[tracing::instrument(skip(self), fields(bucket = %bucket, key = %key))]
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<DeleteOutcome> {
        self.ensure_names_safe(bucket, key)?;
        let blob = BlobId::for_object(bucket, key);
        let _guard = self.locks.lock(&blob).await;

        let record = self.index.get_object(bucket, key)?;
        let blob_missing = match self.blobs.delete(&record.blob).await {
            Ok(()) => false,
            Err(StorageError::BlobNotFound(blob)) => {
                let err = StorageError::IndexInconsistent {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    blob,
                };
                warn!(error = %err, "blob already missing, removing record anyway");
                true
            }
            Err(err) => return Err(err),
        };

        let record = self.index.remove_object(bucket, key)?;
        self.mirror_remove(bucket, key).await;
        info!(blob_missing, "object deleted");

        Ok(if blob_missing {
            DeleteOutcome::DanglingRecordRemoved(record)
        } else {
            DeleteOutcome::Removed(record)
        })
    }

    /// Remove a promoted blob whose index commit failed.
    async fn compensate(&self, blob: &BlobId) {
        match self.blobs.delete(blob).await {
            Ok(()) | Err(StorageError::BlobNotFound(_)) => {}
            Err(err) => error!(%blob, error = %err, "failed to remove orphaned blob"),
        }
    }

    // Replace and delete trail the index with a best-effort catalog write.

    async fn mirror_upsert(&self, bucket: &str, record: &ObjectRecord) {
        if let Some(catalog) = &self.catalog {
            if let Err(err) = catalog.upsert(bucket, record).await {
                error!(error = %err, "failed to persist object to catalog");
            }
        }
    }

    async fn mirror_remove(&self, bucket: &str, key: &str) {
        if let Some(catalog) = &self.catalog {
            if let Err(err) = catalog.remove(bucket, key).await {
                error!(error = %err, "failed to remove object from catalog");
            }
        }
    }
}
