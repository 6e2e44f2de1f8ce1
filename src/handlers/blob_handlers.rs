//! Signed-grant endpoints of the local backend.
//!
//! `PUT /blob/{*key}` and `GET /blob/{*key}` stand in for a cloud store's
//! presigned URLs: the query string must carry a grant minted by
//! [`GrantSigner`](crate::services::object_store::signing::GrantSigner).
//! Bodies are streamed in both directions.

use crate::{
    errors::AppError,
    models::object::ObjectInfo,
    services::object_store::{
        StoreError,
        local::LocalObjectStore,
        signing::{GrantError, GrantOp, GrantParams, URL_COMPONENT},
    },
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use futures::TryStreamExt;
use percent_encoding::utf8_percent_encode;
use std::io;
use tokio_util::io::ReaderStream;

fn local_store(state: &AppState) -> Result<&LocalObjectStore, AppError> {
    state
        .store
        .local
        .as_ref()
        .ok_or_else(|| AppError::not_found("Not found"))
}

fn grant_rejected(err: GrantError) -> AppError {
    AppError::new(StatusCode::FORBIDDEN, err.to_string())
}

fn store_failed(err: StoreError, key: &str) -> AppError {
    match err {
        StoreError::ObjectNotFound(_) => AppError::not_found("Object not found"),
        StoreError::InvalidKey => AppError::bad_request("Invalid object key"),
        other => {
            tracing::error!(key, error = %other, "blob operation failed");
            AppError::internal("Internal server error")
        }
    }
}

/// Upload an object to `/blob/{*key}` under a `put` grant.
pub async fn put_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(grant): Query<GrantParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let local = local_store(&state)?;
    local
        .signer()
        .verify(GrantOp::Put, &key, &grant, Utc::now())
        .map_err(grant_rejected)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    if let Some(granted) = grant.content_type.as_deref() {
        if content_type.as_deref() != Some(granted) {
            return Err(AppError::bad_request(
                "Content-Type does not match the upload grant",
            ));
        }
    }

    let stream = body.into_data_stream().map_err(io::Error::other);
    let object = local
        .upload_object_stream(&key, content_type, stream)
        .await
        .map_err(|err| store_failed(err, &key))?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::CREATED;
    if let Some(etag) = object.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            response.headers_mut().insert(header::ETAG, value);
        }
    }
    Ok(response)
}

/// Download an object from `/blob/{*key}` under a `get` grant.
pub async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(grant): Query<GrantParams>,
) -> Result<Response, AppError> {
    let local = local_store(&state)?;
    local
        .signer()
        .verify(GrantOp::Get, &key, &grant, Utc::now())
        .map_err(grant_rejected)?;

    let (meta, file) = local
        .get_object_reader(&key)
        .await
        .map_err(|err| store_failed(err, &key))?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectInfo) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(meta.content_type_or_default())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );
    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    let name = meta.file_name();
    if !name.is_empty() {
        let disposition = format!(
            "attachment; filename*=UTF-8''{}",
            utf8_percent_encode(name, URL_COMPONENT)
        );
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
}
