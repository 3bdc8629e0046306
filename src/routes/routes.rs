//! Routes for bucket and object operations.
//!
//! ## Structure
//! - `GET    /buckets`                                bucket names
//! - `GET    /buckets/{bucket}`                       objects in the bucket
//! - `GET    /buckets/{bucket}/objects/{id}`           object metadata
//! - `GET    /buckets/{bucket}/objects/{id}/content`   object bytes
//! - `POST   /buckets/{bucket}/objects/{id}`           create (multipart `file`)
//! - `PUT    /buckets/{bucket}/objects/{id}`           replace (multipart `file`)
//! - `DELETE /buckets/{bucket}/objects/{id}`           delete

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_object, get_object, get_object_content, list_buckets, list_objects,
            update_object, upload_object,
        },
    },
    services::storage_service::StorageService,
};
use axum::{Router, extract::DefaultBodyLimit, routing::get};

/// Build the router. `max_upload_bytes` caps request bodies, uploads included.
pub fn routes(max_upload_bytes: usize) -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/buckets", get(list_buckets))
        .route("/buckets/{bucket}", get(list_objects))
        .route(
            "/buckets/{bucket}/objects/{id}",
            get(get_object)
                .post(upload_object)
                .put(update_object)
                .delete(delete_object),
        )
        .route(
            "/buckets/{bucket}/objects/{id}/content",
            get(get_object_content),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
