//! HTTP handlers for bucket and object operations.
//! Uploads arrive as multipart forms whose `file` field is streamed straight
//! into `StorageService`; downloads stream the blob back out.

use crate::{
    errors::AppError,
    models::object::{ObjectRecord, UploadMeta},
    services::storage_service::StorageService,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Serialize;
use std::io;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Name of the multipart field carrying the object bytes.
const FILE_FIELD: &str = "file";

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

fn message(status: StatusCode, message: &'static str) -> (StatusCode, Json<MessageResponse>) {
    (status, Json(MessageResponse { message }))
}

#[derive(Clone, Copy)]
enum WriteMode {
    Create,
    Replace,
}

/// Stream the `file` field of a multipart form into the store.
///
/// Other fields are skipped. The field is consumed inside the loop because
/// it mutably borrows the multipart reader.
async fn write_from_multipart(
    service: &StorageService,
    bucket: &str,
    key: &str,
    mut multipart: Multipart,
    mode: WriteMode,
) -> Result<ObjectRecord, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let upload = UploadMeta {
            filename: field.file_name().map(str::to_string),
            content_type: field.content_type().map(str::to_string),
        };
        let stream = field.map(|chunk| chunk.map_err(io::Error::other));
        let record = match mode {
            WriteMode::Create => service.create_object(bucket, key, upload, stream).await?,
            WriteMode::Replace => service.replace_object(bucket, key, upload, stream).await?,
        };
        return Ok(record);
    }
    Err(AppError::bad_request(format!(
        "multipart field `{}` is required",
        FILE_FIELD
    )))
}

/// `GET /buckets`
pub async fn list_buckets(State(service): State<StorageService>) -> Json<Vec<String>> {
    Json(service.list_buckets())
}

/// `GET /buckets/{bucket}`: objects in insertion order.
pub async fn list_objects(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
) -> Result<Json<Vec<ObjectRecord>>, AppError> {
    Ok(Json(service.list_objects(&bucket)?))
}

/// `GET /buckets/{bucket}/objects/{id}`: object metadata.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<ObjectRecord>, AppError> {
    Ok(Json(service.get_object(&bucket, &key)?))
}

/// `GET /buckets/{bucket}/objects/{id}/content`: object bytes as a stream.
pub async fn get_object_content(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, file) = service.get_object_reader(&bucket, &key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `POST /buckets/{bucket}/objects/{id}`: create from multipart `file`.
pub async fn upload_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    write_from_multipart(&service, &bucket, &key, multipart, WriteMode::Create).await?;
    Ok(message(StatusCode::CREATED, "Object uploaded successfully"))
}

/// `PUT /buckets/{bucket}/objects/{id}`: replace bytes and filename.
pub async fn update_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    write_from_multipart(&service, &bucket, &key, multipart, WriteMode::Replace).await?;
    Ok(message(StatusCode::OK, "Object updated successfully"))
}

/// `DELETE /buckets/{bucket}/objects/{id}`
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = service.delete_object(&bucket, &key).await?;
    debug!(id = %outcome.record().id, "delete handled");
    Ok(message(StatusCode::OK, "Object deleted successfully"))
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectRecord) {
    let content_type = meta
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    let last_modified = meta
        .last_modified
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    let disposition = format!(
        "attachment; filename=\"{}\"",
        meta.filename.replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

#[cfg(test)]
mod tests {
    use crate::{routes::routes::routes, services::{reconcile::OrphanPolicy, storage_service::StorageService}};
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode, header},
        response::Response,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "object-store-test-boundary";

    async fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let service = StorageService::open(dir.path(), None, OrphanPolicy::default())
            .await
            .unwrap();
        (dir, routes(1024 * 1024).with_state(service))
    }

    fn multipart(method: Method, uri: &str, field: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"note\"\r\n\r\n\
             ignored\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: image/png\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn logo_lifecycle_over_http() {
        let (_dir, app) = app().await;
        let uri = "/buckets/images/objects/logo.png";
        let png = [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

        let res = send(&app, multipart(Method::POST, uri, "file", "logo.png", &png)).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(json(res).await["message"], "Object uploaded successfully");

        let res = send(&app, multipart(Method::POST, uri, "file", "logo.png", &png)).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let meta = json(send(&app, request(Method::GET, uri)).await).await;
        assert_eq!(meta["key"], "logo.png");
        assert_eq!(meta["filename"], "logo.png");
        assert_eq!(meta["size"], png.len());
        assert_eq!(meta["content_type"], "image/png");
        assert!(meta.get("blob").is_none());

        let res = send(&app, request(Method::GET, &format!("{uri}/content"))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(res.headers()[header::CONTENT_LENGTH], "8");
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &png);

        let res = send(&app, multipart(Method::PUT, uri, "file", "logo2.png", b"v2")).await;
        assert_eq!(res.status(), StatusCode::OK);
        let meta = json(send(&app, request(Method::GET, uri)).await).await;
        assert_eq!(meta["filename"], "logo2.png");
        assert_eq!(meta["size"], 2);

        let res = send(&app, request(Method::DELETE, uri)).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json(res).await["message"], "Object deleted successfully");

        let res = send(&app, request(Method::GET, uri)).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(res).await["status"], 404);

        let listed = json(send(&app, request(Method::GET, "/buckets/images")).await).await;
        assert_eq!(listed, serde_json::json!([]));
        let buckets = json(send(&app, request(Method::GET, "/buckets")).await).await;
        assert_eq!(buckets, serde_json::json!(["images"]));
    }

    #[tokio::test]
    async fn unknown_bucket_and_object() {
        let (_dir, app) = app().await;
        let res = send(&app, request(Method::GET, "/buckets/none")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = send(&app, multipart(Method::PUT, "/buckets/none/objects/k", "file", "k", b"x")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = send(&app, request(Method::DELETE, "/buckets/none/objects/k")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_without_file_field_is_rejected() {
        let (_dir, app) = app().await;
        let res = send(
            &app,
            multipart(Method::POST, "/buckets/b/objects/k", "attachment", "k", b"x"),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let buckets = json(send(&app, request(Method::GET, "/buckets")).await).await;
        assert_eq!(buckets, serde_json::json!([]));
    }
}
