//! Durable blob storage on the local filesystem.
//!
//! Layout beneath the storage root:
//!
//! - `blobs/{ab}/{cd}/{blob_id}` canonical locations, sharded by digest prefix
//! - `staging/{uuid}.tmp` in-flight uploads
//! - `orphans/{blob_id}` blobs quarantined by reconciliation
//!
//! Uploads are streamed into `staging/`, fsynced, and renamed into place.
//! Staging and canonical directories share a filesystem, so the rename is
//! atomic and a reader either sees the old bytes or the new ones.

use super::error::{StorageError, StorageResult};
use crate::models::object::BlobId;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

const BLOB_DIR: &str = "blobs";
const STAGING_DIR: &str = "staging";
const ORPHAN_DIR: &str = "orphans";
const STAGING_SUFFIX: &str = "tmp";
const PROMOTE_ATTEMPTS: u32 = 3;

/// Size and checksum of a fully written blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: u64,
    pub etag: String,
}

/// A fully written, fsynced upload waiting in the staging area.
///
/// Dropping it without promotion deletes the temp file. That covers both
/// explicit aborts and a request future being cancelled mid-flight.
#[derive(Debug)]
pub struct StagedBlob {
    path: PathBuf,
    info: BlobInfo,
    promoted: bool,
}

impl StagedBlob {
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        // Drop cannot await; a single blocking unlink on the worker is fine.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("discarded staged blob {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to discard staged blob {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (and create if needed) a blob store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        for dir in [BLOB_DIR, STAGING_DIR, ORPHAN_DIR] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_root(&self) -> PathBuf {
        self.root.join(BLOB_DIR)
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn orphans_root(&self) -> PathBuf {
        self.root.join(ORPHAN_DIR)
    }

    /// Canonical location of a blob. Parent directories may not exist yet.
    pub fn blob_path(&self, id: &BlobId) -> PathBuf {
        let (shard_a, shard_b) = id.shards();
        let mut path = self.blobs_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.as_str());
        path
    }

    /// Stream bytes into a fresh temp file under `staging/`.
    ///
    /// Computes size and MD5 while streaming and fsyncs before returning.
    /// Any stream or disk error removes the temp file.
    pub async fn stage<S>(&self, stream: S) -> StorageResult<StagedBlob>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let tmp_path = self
            .staging_root()
            .join(format!("{}.{}", Uuid::new_v4(), STAGING_SUFFIX));
        // Any early return below drops the guard and removes the temp file.
        let mut staged = StagedBlob {
            path: tmp_path,
            info: BlobInfo {
                size: 0,
                etag: String::new(),
            },
            promoted: false,
        };
        let mut file = File::create(&staged.path)
            .await
            .map_err(StorageError::BlobWriteFailed)?;

        let mut size: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(StorageError::BlobWriteFailed)?;
            size += chunk.len() as u64;
            digest.consume(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(StorageError::BlobWriteFailed)?;
        }
        file.flush().await.map_err(StorageError::BlobWriteFailed)?;
        file.sync_all().await.map_err(StorageError::BlobWriteFailed)?;
        drop(file);

        staged.info = BlobInfo {
            size,
            etag: format!("{:x}", digest.compute()),
        };
        debug!(size, "staged blob at {}", staged.path.display());
        Ok(staged)
    }

    /// Atomically move a staged blob over the canonical location for `id`.
    ///
    /// On failure the previous blob (if any) is untouched and the temp file
    /// is discarded.
    pub async fn promote(&self, mut staged: StagedBlob, id: &BlobId) -> StorageResult<BlobInfo> {
        let final_path = self.blob_path(id);
        let parent = final_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::BlobWriteFailed(io::Error::new(
                ErrorKind::Other,
                "blob path missing parent directory",
            ))
        })?;
        // A delete of a sibling blob may prune the shard directory between
        // creating it and renaming into it.
        let mut attempts = 0;
        loop {
            fs::create_dir_all(&parent)
                .await
                .map_err(StorageError::BlobWriteFailed)?;
            match fs::rename(&staged.path, &final_path).await {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::NotFound && attempts < PROMOTE_ATTEMPTS => {
                    attempts += 1;
                }
                Err(err) => return Err(StorageError::BlobWriteFailed(err)),
            }
        }
        staged.promoted = true;

        // Persist the directory entry. The rename already happened, so a
        // failure here is logged rather than reported as a failed promote.
        if let Err(err) = sync_dir(&parent).await {
            debug!("fsync of {} failed: {}", parent.display(), err);
        }
        debug!("promoted blob {} to {}", id, final_path.display());
        Ok(staged.info.clone())
    }

    /// Stage and promote in one step.
    pub async fn write<S>(&self, id: &BlobId, stream: S) -> StorageResult<BlobInfo>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let staged = self.stage(stream).await?;
        self.promote(staged, id).await
    }

    /// Open a blob for streaming out.
    pub async fn read(&self, id: &BlobId) -> StorageResult<File> {
        File::open(self.blob_path(id))
            .await
            .map_err(|err| not_found_as_blob(err, id))
    }

    /// Remove the canonical blob. Reports `BlobNotFound` if it is already gone.
    pub async fn delete(&self, id: &BlobId) -> StorageResult<()> {
        let path = self.blob_path(id);
        fs::remove_file(&path)
            .await
            .map_err(|err| not_found_as_blob(err, id))?;
        debug!("removed blob file {}", path.display());

        if let Some(parent) = path.parent() {
            prune_empty_dirs(parent, &self.blobs_root()).await;
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn exists(&self, id: &BlobId) -> StorageResult<bool> {
        Ok(fs::try_exists(self.blob_path(id)).await?)
    }

    pub async fn blob_len(&self, id: &BlobId) -> StorageResult<u64> {
        let meta = fs::metadata(self.blob_path(id))
            .await
            .map_err(|err| not_found_as_blob(err, id))?;
        Ok(meta.len())
    }

    /// Recompute size and MD5 of a canonical blob from its bytes on disk.
    pub async fn checksum(&self, id: &BlobId) -> StorageResult<BlobInfo> {
        let mut chunks = ReaderStream::new(self.read(id).await?);
        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            digest.consume(&chunk);
        }
        Ok(BlobInfo {
            size,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Every canonical blob currently on disk.
    ///
    /// Files that do not look like blob ids are skipped.
    pub async fn list_blob_ids(&self) -> StorageResult<Vec<BlobId>> {
        let mut ids = Vec::new();
        for shard_a in read_dir_paths(&self.blobs_root()).await? {
            if !fs::metadata(&shard_a).await?.is_dir() {
                continue;
            }
            for shard_b in read_dir_paths(&shard_a).await? {
                if !fs::metadata(&shard_b).await?.is_dir() {
                    continue;
                }
                for file in read_dir_paths(&shard_b).await? {
                    let parsed = file
                        .file_name()
                        .and_then(|name| name.to_str())
                        .and_then(BlobId::parse);
                    match parsed {
                        Some(id) => ids.push(id),
                        None => debug!("ignoring unexpected file {}", file.display()),
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete temp files left behind by uploads that never finished.
    pub async fn sweep_staging(&self) -> StorageResult<usize> {
        let mut removed = 0;
        for path in read_dir_paths(&self.staging_root()).await? {
            let is_temp = path
                .extension()
                .is_some_and(|ext| ext == STAGING_SUFFIX);
            if !is_temp {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }

    /// Move a canonical blob into `orphans/`, out of reach of any record.
    pub async fn quarantine(&self, id: &BlobId) -> StorageResult<PathBuf> {
        let from = self.blob_path(id);
        let to = self.orphans_root().join(id.as_str());
        fs::rename(&from, &to)
            .await
            .map_err(|err| not_found_as_blob(err, id))?;
        if let Some(parent) = from.parent() {
            prune_empty_dirs(parent, &self.blobs_root()).await;
        }
        Ok(to)
    }

    /// Write, read back, and delete a small file in the staging area.
    pub async fn probe(&self) -> io::Result<()> {
        let path = self.staging_root().join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&path, b"probe").await?;
        let read = fs::read(&path).await;
        let removed = fs::remove_file(&path).await;
        if read? != b"probe" {
            return Err(io::Error::new(ErrorKind::Other, "probe content mismatch"));
        }
        removed
    }
}

fn not_found_as_blob(err: io::Error, id: &BlobId) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::BlobNotFound(id.clone())
    } else {
        StorageError::Io(err)
    }
}

async fn read_dir_paths(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    Ok(paths)
}

async fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir).await?.sync_all().await
}

/// Remove empty shard directories up to (not including) `stop`.
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::stream;
    use tokio::io::AsyncReadExt;

    pub(crate) fn byte_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    pub(crate) fn failing_stream() -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ])
    }

    pub(crate) async fn read_all(store: &BlobStore, id: &BlobId) -> Vec<u8> {
        let mut file = store.read(id).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn staging_entries(store: &BlobStore) -> usize {
        read_dir_paths(&store.staging_root()).await.unwrap().len()
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let id = BlobId::for_object("images", "logo.png");

        let info = store
            .write(&id, byte_stream(vec![b"hello-", b"world"]))
            .await
            .unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(info.etag, format!("{:x}", md5::compute(b"hello-world")));
        assert_eq!(read_all(&store, &id).await, b"hello-world");
        assert_eq!(store.blob_len(&id).await.unwrap(), 11);
        assert_eq!(store.checksum(&id).await.unwrap(), info);
        assert_eq!(staging_entries(&store).await, 0);
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let id = BlobId::for_object("b", "k");

        let err = store.write(&id, failing_stream()).await.unwrap_err();
        assert!(matches!(err, StorageError::BlobWriteFailed(_)));
        assert!(err.is_retryable());
        assert!(!store.exists(&id).await.unwrap());
        assert_eq!(staging_entries(&store).await, 0);
    }

    #[tokio::test]
    async fn dropped_staged_blob_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let staged = store.stage(byte_stream(vec![b"abc"])).await.unwrap();
        assert!(staged.path().exists());
        let path = staged.path().to_path_buf();
        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn crash_between_stage_and_promote_keeps_old_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let id = BlobId::for_object("b", "k");
        store.write(&id, byte_stream(vec![b"old"])).await.unwrap();

        // A crash skips every destructor, so the temp file survives.
        let staged = store.stage(byte_stream(vec![b"new-bytes"])).await.unwrap();
        std::mem::forget(staged);

        assert_eq!(read_all(&store, &id).await, b"old");
        assert_eq!(staging_entries(&store).await, 1);
        assert_eq!(store.sweep_staging().await.unwrap(), 1);
        assert_eq!(staging_entries(&store).await, 0);
        assert_eq!(read_all(&store, &id).await, b"old");
    }

    #[tokio::test]
    async fn promote_replaces_existing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let id = BlobId::for_object("b", "k");
        store.write(&id, byte_stream(vec![b"old"])).await.unwrap();

        let staged = store.stage(byte_stream(vec![b"new"])).await.unwrap();
        store.promote(staged, &id).await.unwrap();
        assert_eq!(read_all(&store, &id).await, b"new");
    }

    #[tokio::test]
    async fn delete_reports_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let id = BlobId::for_object("b", "k");
        store.write(&id, byte_stream(vec![b"x"])).await.unwrap();

        store.delete(&id).await.unwrap();
        assert!(!store.exists(&id).await.unwrap());
        // shard directories are pruned with the last blob
        assert!(!store.blob_path(&id).parent().unwrap().exists());
        assert!(matches!(
            store.delete(&id).await,
            Err(StorageError::BlobNotFound(missing)) if missing == id
        ));
        assert!(matches!(
            store.read(&id).await,
            Err(StorageError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_and_quarantine() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let a = BlobId::for_object("b", "a");
        let c = BlobId::for_object("b", "c");
        store.write(&a, byte_stream(vec![b"1"])).await.unwrap();
        store.write(&c, byte_stream(vec![b"2"])).await.unwrap();

        let mut expected = vec![a.clone(), c.clone()];
        expected.sort();
        assert_eq!(store.list_blob_ids().await.unwrap(), expected);

        let moved = store.quarantine(&a).await.unwrap();
        assert!(moved.exists());
        assert_eq!(store.list_blob_ids().await.unwrap(), vec![c]);
    }

    #[tokio::test]
    async fn probe_succeeds_on_writable_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        store.probe().await.unwrap();
        assert_eq!(staging_entries(&store).await, 0);
    }
}
