//! Core data models for the object storage service.
//!
//! Object records are what the index stores and what the HTTP layer
//! serializes as JSON; blob ids tie a record to its bytes on disk.

pub mod object;
