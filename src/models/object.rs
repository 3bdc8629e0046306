//! Represents an object (file) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Storage-internal address of a blob.
///
/// Derived deterministically from `(bucket, key)` so the same object always
/// resolves to the same canonical file. The bucket is length-prefixed before
/// hashing, which keeps `("a/b", "c")` and `("a", "b/c")` apart.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId(String);

impl BlobId {
    pub fn for_object(bucket: &str, key: &str) -> Self {
        let digest = md5::compute(format!("{}:{}/{}", bucket.len(), bucket, key));
        Self(format!("{:x}", digest))
    }

    /// Parse a file name found under the blob directory.
    ///
    /// Returns `None` for anything that is not a 32-char lowercase hex digest.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = raw.len() == 32 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-level shard directories (`ab`, `cd`) taken from the digest prefix.
    pub fn shards(&self) -> (&str, &str) {
        (&self.0[0..2], &self.0[2..4])
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for a single object within a bucket.
///
/// The record never carries the content bytes; those live in the blob store
/// under `blob`.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ObjectRecord {
    /// Stable identifier, preserved when the object is replaced.
    pub id: Uuid,

    /// Object key, unique within its bucket.
    pub key: String,

    /// Original filename of the uploaded file.
    pub filename: String,

    /// Content type (MIME type) reported by the uploader.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size: u64,

    /// Hex MD5 of the content.
    pub etag: String,

    #[serde(skip)]
    pub blob: BlobId,

    /// Per-bucket sequence number fixing the listing order. Assigned by the
    /// index on insert and kept across replaces and restarts.
    #[serde(skip)]
    pub position: i64,

    /// Timestamp of the last create or replace.
    pub last_modified: DateTime<Utc>,
}

/// Display metadata supplied alongside an upload stream.
#[derive(Clone, Debug, Default)]
pub struct UploadMeta {
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_id_is_stable_and_bucket_scoped() {
        let a = BlobId::for_object("images", "logo.png");
        assert_eq!(a, BlobId::for_object("images", "logo.png"));
        assert_ne!(a, BlobId::for_object("docs", "logo.png"));
        assert_ne!(
            BlobId::for_object("a/b", "c"),
            BlobId::for_object("a", "b/c")
        );
    }

    #[test]
    fn blob_id_parse_accepts_only_digests() {
        let id = BlobId::for_object("images", "logo.png");
        assert_eq!(BlobId::parse(id.as_str()), Some(id.clone()));
        assert_eq!(BlobId::parse("not-a-digest"), None);
        assert_eq!(BlobId::parse(&id.as_str().to_uppercase()), None);

        let (a, b) = id.shards();
        assert_eq!(format!("{a}{b}"), &id.as_str()[..4]);
    }
}
