use crate::models::object::BlobId;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("object `{key}` already exists in bucket `{bucket}`")]
    ObjectAlreadyExists { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("blob `{0}` not found")]
    BlobNotFound(BlobId),
    #[error("blob write failed: {0}")]
    BlobWriteFailed(#[source] io::Error),
    /// The index references a blob that is gone. Always a bug.
    #[error("object `{key}` in bucket `{bucket}` references missing blob `{blob}`")]
    IndexInconsistent {
        bucket: String,
        key: String,
        blob: BlobId,
    },
    #[error(transparent)]
    Catalog(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    pub(crate) fn object_not_found(bucket: &str, key: &str) -> Self {
        Self::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn already_exists(bucket: &str, key: &str) -> Self {
        Self::ObjectAlreadyExists {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Only staging/promotion failures are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BlobWriteFailed(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
