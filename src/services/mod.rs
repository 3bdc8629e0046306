//! Storage engine: index, blob store, per-key locks, catalog, and the
//! service that coordinates them.

pub mod blob_store;
pub mod catalog;
pub mod error;
pub mod index;
pub mod key_locks;
pub mod reconcile;
pub mod storage_service;
