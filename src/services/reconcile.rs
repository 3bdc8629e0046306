//! Startup reconciliation between the catalog and the blob directory.
//!
//! Runs once, before the server accepts requests:
//!
//! 1. sweep temp files left in `staging/` by uploads that never finished
//! 2. load catalog rows into the index, dropping rows whose blob is gone
//! 3. correct size/etag of rows that disagree with the bytes on disk
//! 4. apply the orphan policy to blobs that no row references

use super::{
    blob_store::BlobStore,
    catalog::Catalog,
    error::StorageResult,
    index::Index,
};
use std::collections::HashSet;
use tracing::{info, warn};

/// What to do with a canonical blob that no catalog row references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OrphanPolicy {
    /// Move it to `orphans/` for manual inspection.
    #[default]
    Quarantine,
    /// Remove it.
    Delete,
    /// Leave it in place and only log it.
    Keep,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub staging_swept: usize,
    pub restored: usize,
    pub dangling_dropped: usize,
    pub repaired: usize,
    pub orphans: usize,
}

pub async fn reconcile(
    index: &Index,
    blobs: &BlobStore,
    catalog: &Catalog,
    policy: OrphanPolicy,
) -> StorageResult<ReconcileReport> {
    let mut report = ReconcileReport {
        staging_swept: blobs.sweep_staging().await?,
        ..Default::default()
    };

    let snapshot = catalog.load().await?;
    for bucket in &snapshot.buckets {
        index.ensure_bucket(bucket);
    }

    let on_disk: HashSet<_> = blobs.list_blob_ids().await?.into_iter().collect();
    let mut referenced = HashSet::new();

    for (bucket, mut record) in snapshot.objects {
        if !on_disk.contains(&record.blob) {
            warn!(
                bucket = %bucket,
                key = %record.key,
                blob = %record.blob,
                "catalog row references missing blob, dropping it"
            );
            catalog.remove(&bucket, &record.key).await?;
            report.dangling_dropped += 1;
            continue;
        }

        if blobs.blob_len(&record.blob).await? != record.size {
            let info = blobs.checksum(&record.blob).await?;
            warn!(
                bucket = %bucket,
                key = %record.key,
                recorded = record.size,
                actual = info.size,
                "catalog size disagrees with blob, repairing"
            );
            catalog.set_blob_info(&bucket, &record.key, &info).await?;
            record.size = info.size;
            record.etag = info.etag;
            report.repaired += 1;
        }

        referenced.insert(record.blob.clone());
        index.restore_object(&bucket, record)?;
        report.restored += 1;
    }

    for id in on_disk.difference(&referenced) {
        report.orphans += 1;
        match policy {
            OrphanPolicy::Quarantine => {
                let moved = blobs.quarantine(id).await?;
                warn!(blob = %id, "quarantined orphaned blob to {}", moved.display());
            }
            OrphanPolicy::Delete => {
                blobs.delete(id).await?;
                warn!(blob = %id, "deleted orphaned blob");
            }
            OrphanPolicy::Keep => warn!(blob = %id, "orphaned blob left in place"),
        }
    }

    info!(?report, "reconciliation finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::{BlobId, ObjectRecord},
        services::blob_store::tests::byte_stream,
    };
    use chrono::Utc;
    use uuid::Uuid;

    async fn seeded(policy: OrphanPolicy) -> (tempfile::TempDir, BlobStore, Index, ReconcileReport) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).await.unwrap();
        let catalog = Catalog::connect("sqlite::memory:").await.unwrap();

        // healthy row
        let good = blobs
            .write(&BlobId::for_object("docs", "good"), byte_stream(vec![b"good"]))
            .await
            .unwrap();
        catalog
            .upsert("docs", &record("docs", "good", 0, good.size, &good.etag))
            .await
            .unwrap();

        // row whose blob vanished
        catalog
            .upsert("docs", &record("docs", "dangling", 1, 3, "x"))
            .await
            .unwrap();

        // row with a stale size
        blobs
            .write(&BlobId::for_object("docs", "stale"), byte_stream(vec![b"longer body"]))
            .await
            .unwrap();
        catalog
            .upsert("docs", &record("docs", "stale", 2, 1, "x"))
            .await
            .unwrap();

        // blob nobody references, plus an abandoned upload
        blobs
            .write(&BlobId::for_object("docs", "orphan"), byte_stream(vec![b"?"]))
            .await
            .unwrap();
        std::mem::forget(blobs.stage(byte_stream(vec![b"half"])).await.unwrap());

        // bucket whose objects were all deleted
        catalog
            .upsert("empty", &record("empty", "gone", 0, 1, "x"))
            .await
            .unwrap();
        catalog.remove("empty", "gone").await.unwrap();

        let index = Index::new();
        let report = reconcile(&index, &blobs, &catalog, policy).await.unwrap();
        (dir, blobs, index, report)
    }

    fn record(bucket: &str, key: &str, position: i64, size: u64, etag: &str) -> ObjectRecord {
        ObjectRecord {
            id: Uuid::new_v4(),
            key: key.to_string(),
            filename: key.to_string(),
            content_type: None,
            size,
            etag: etag.to_string(),
            blob: BlobId::for_object(bucket, key),
            position,
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn restores_and_repairs() {
        let (_dir, blobs, index, report) = seeded(OrphanPolicy::Quarantine).await;
        assert_eq!(
            report,
            ReconcileReport {
                staging_swept: 1,
                restored: 2,
                dangling_dropped: 1,
                repaired: 1,
                orphans: 1,
            }
        );

        assert_eq!(index.list_buckets(), vec!["docs", "empty"]);
        let keys: Vec<_> = index
            .list_objects("docs")
            .unwrap()
            .into_iter()
            .map(|rec| rec.key)
            .collect();
        assert_eq!(keys, vec!["good", "stale"]);

        let stale = index.get_object("docs", "stale").unwrap();
        assert_eq!(stale.size, 11);
        assert_eq!(stale.etag, format!("{:x}", md5::compute(b"longer body")));

        let orphan = BlobId::for_object("docs", "orphan");
        assert!(!blobs.exists(&orphan).await.unwrap());
        assert!(blobs.root().join("orphans").join(orphan.as_str()).exists());
    }

    #[tokio::test]
    async fn delete_policy_removes_orphans() {
        let (_dir, blobs, _index, report) = seeded(OrphanPolicy::Delete).await;
        assert_eq!(report.orphans, 1);
        let orphan = BlobId::for_object("docs", "orphan");
        assert!(!blobs.exists(&orphan).await.unwrap());
        assert!(!blobs.root().join("orphans").join(orphan.as_str()).exists());
    }

    #[tokio::test]
    async fn keep_policy_leaves_orphans() {
        let (_dir, blobs, index, report) = seeded(OrphanPolicy::Keep).await;
        assert_eq!(report.orphans, 1);
        assert!(blobs.exists(&BlobId::for_object("docs", "orphan")).await.unwrap());
        assert!(!index.contains("docs", "orphan"));
    }
}
