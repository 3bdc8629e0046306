//! In-memory index of buckets and their object records.
//!
//! The bucket table sits behind one `RwLock` that is only written when a
//! bucket appears for the first time. Each bucket owns its own `RwLock`, so
//! mutations serialize per bucket while readers and other buckets proceed.
//! No lock here is ever held across an `.await`.
//!
//! List positions are handed out under the bucket's write lock, so the
//! order of `position` values always matches the order of the records.

use super::error::{StorageError, StorageResult};
use crate::models::object::ObjectRecord;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

#[derive(Default)]
struct Bucket {
    objects: Vec<ObjectRecord>,
    next_position: i64,
}

type BucketObjects = RwLock<Bucket>;

#[derive(Default)]
struct BucketTable {
    /// Bucket names in first-insertion order.
    order: Vec<String>,
    by_name: HashMap<String, Arc<BucketObjects>>,
}

#[derive(Default)]
pub struct Index {
    buckets: RwLock<BucketTable>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, bucket: &str) -> StorageResult<Arc<BucketObjects>> {
        self.buckets
            .read()
            .by_name
            .get(bucket)
            .cloned()
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))
    }

    fn bucket_or_create(&self, bucket: &str) -> Arc<BucketObjects> {
        if let Some(objects) = self.buckets.read().by_name.get(bucket) {
            return objects.clone();
        }
        let mut table = self.buckets.write();
        if let Some(objects) = table.by_name.get(bucket) {
            return objects.clone();
        }
        let objects = Arc::new(BucketObjects::default());
        table.order.push(bucket.to_string());
        table.by_name.insert(bucket.to_string(), objects.clone());
        objects
    }

    /// Register a bucket with no objects. Used when restoring from the catalog.
    pub fn ensure_bucket(&self, bucket: &str) {
        self.bucket_or_create(bucket);
    }

    pub fn list_buckets(&self) -> Vec<String> {
        self.buckets.read().order.clone()
    }

    pub fn list_objects(&self, bucket: &str) -> StorageResult<Vec<ObjectRecord>> {
        Ok(self.bucket(bucket)?.read().objects.clone())
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectRecord> {
        self.bucket(bucket)?
            .read()
            .objects
            .iter()
            .find(|obj| obj.key == key)
            .cloned()
            .ok_or_else(|| StorageError::object_not_found(bucket, key))
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.bucket(bucket)
            .map(|objects| objects.read().objects.iter().any(|obj| obj.key == key))
            .unwrap_or(false)
    }

    /// Append a new record, creating the bucket on first use.
    ///
    /// The record's `position` is overwritten with the bucket's next one.
    /// Returns the record as stored.
    pub fn insert_object(
        &self,
        bucket: &str,
        key: &str,
        mut record: ObjectRecord,
    ) -> StorageResult<ObjectRecord> {
        debug_assert_eq!(record.key, key);
        let slot = self.bucket_or_create(bucket);
        let mut slot = slot.write();
        if slot.objects.iter().any(|obj| obj.key == key) {
            return Err(StorageError::already_exists(bucket, key));
        }
        record.position = slot.next_position;
        slot.next_position += 1;
        slot.objects.push(record.clone());
        Ok(record)
    }

    /// Append a record loaded from the catalog, keeping its `position`.
    ///
    /// Records must arrive in ascending position order per bucket.
    pub fn restore_object(&self, bucket: &str, record: ObjectRecord) -> StorageResult<()> {
        let slot = self.bucket_or_create(bucket);
        let mut slot = slot.write();
        if slot.objects.iter().any(|obj| obj.key == record.key) {
            return Err(StorageError::already_exists(bucket, &record.key));
        }
        slot.next_position = slot.next_position.max(record.position + 1);
        slot.objects.push(record);
        Ok(())
    }

    /// Overwrite an existing record in place, keeping its list position
    /// (the stored `position` wins over the one passed in).
    ///
    /// Returns the record that was replaced.
    pub fn replace_object(
        &self,
        bucket: &str,
        key: &str,
        mut record: ObjectRecord,
    ) -> StorageResult<ObjectRecord> {
        debug_assert_eq!(record.key, key);
        let slot = self.bucket(bucket)?;
        let mut slot = slot.write();
        let current = slot
            .objects
            .iter_mut()
            .find(|obj| obj.key == key)
            .ok_or_else(|| StorageError::object_not_found(bucket, key))?;
        record.position = current.position;
        Ok(std::mem::replace(current, record))
    }

    pub fn remove_object(&self, bucket: &str, key: &str) -> StorageResult<ObjectRecord> {
        let slot = self.bucket(bucket)?;
        let mut slot = slot.write();
        let idx = slot
            .objects
            .iter()
            .position(|obj| obj.key == key)
            .ok_or_else(|| StorageError::object_not_found(bucket, key))?;
        Ok(slot.objects.remove(idx))
    }

    /// Total number of records across all buckets.
    pub fn len(&self) -> usize {
        let table = self.buckets.read();
        table
            .by_name
            .values()
            .map(|slot| slot.read().objects.len())
            .sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
