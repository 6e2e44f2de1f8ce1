//! HTTP handlers for the transfer lifecycle: upload grants, finalize/lock,
//! gated listing, single-file download, bulk zip and delete.
//!
//! The transfer password always travels in the `x-transfer-password`
//! header or a JSON body, never in the query string.

use crate::{
    errors::AppError,
    models::{
        object::DEFAULT_CONTENT_TYPE,
        transfer::{
            FileDescriptor, MetadataPatch, TransferId, is_metadata_object, split_object_key,
        },
    },
    services::object_store::signing::URL_COMPONENT,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Redirect, Response},
};
use percent_encoding::utf8_percent_encode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const PASSWORD_HEADER: &str = "x-transfer-password";
pub const CREATOR_EMAIL_HEADER: &str = "x-authenticated-email";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn parse_id(raw: &str) -> Result<TransferId, AppError> {
    TransferId::parse(raw).map_err(AppError::from)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SasQuery {
    pub file: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SasResponse {
    pub sas_token_url: String,
}

/// `GET /sas?file={transferId}/{relativePath}&contentType=`
pub async fn issue_upload_grant(
    State(state): State<AppState>,
    Query(q): Query<SasQuery>,
) -> Result<Json<SasResponse>, AppError> {
    let file = q
        .file
        .filter(|f| !f.is_empty())
        .ok_or_else(|| AppError::bad_request("File name is required"))?;
    let (id, relative) = split_object_key(&file)?;
    if is_metadata_object(&relative) {
        return Err(AppError::bad_request("File name is reserved"));
    }
    let content_type = q
        .content_type
        .filter(|ct| !ct.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    let key = id.object_key(&relative);
    let url = state
        .store
        .store
        .issue_upload_grant(&key, &content_type)
        .await
        .map_err(|err| AppError::from_transfer(err.into(), "Failed to generate SAS token"))?;
    tracing::debug!(transfer_id = %id, key, "issued upload grant");

    Ok(Json(SasResponse { sas_token_url: url }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub name: Option<String>,
    pub size: Option<i64>,
    pub file_count: Option<i64>,
}

/// `POST /transfer/{id}/finalize`
pub async fn finalize_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FinalizeRequest>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    if body.size.is_some_and(|s| s < 0) || body.file_count.is_some_and(|c| c < 0) {
        return Err(AppError::bad_request("size and fileCount must not be negative"));
    }

    let patch = MetadataPatch {
        name: body.name.filter(|n| !n.trim().is_empty()),
        size_bytes: body.size,
        file_count: body.file_count,
        creator_email: header_str(&headers, CREATOR_EMAIL_HEADER).map(str::to_string),
        ..MetadataPatch::default()
    };
    state
        .metadata
        .upsert(&id, patch)
        .await
        .map_err(|err| AppError::from_transfer(err, "Failed to finalize transfer"))?;
    tracing::info!(transfer_id = %id, "transfer finalized");

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LockRequest {
    pub password: Option<String>,
}

/// `POST /transfer/{id}/lock`
///
/// Sets or replaces the transfer password.
pub async fn lock_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LockRequest>,
) -> Result<Json<Value>, AppError> {
    let id = parse_id(&id)?;
    let password = body
        .password
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("Valid password is required"))?;

    let hash = state
        .gate
        .hash(&password)
        .await
        .map_err(|err| AppError::from_transfer(err.into(), "Failed to lock transfer"))?;
    state
        .metadata
        .upsert(
            &id,
            MetadataPatch {
                password_hash: Some(hash),
                ..MetadataPatch::default()
            },
        )
        .await
        .map_err(|err| AppError::from_transfer(err, "Failed to lock transfer"))?;
    tracing::info!(transfer_id = %id, "transfer locked");

    Ok(Json(json!({
        "success": true,
        "message": "Transfer locked successfully"
    })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferResponse {
    pub files: Vec<FileDescriptor>,
    pub name: Option<String>,
}

/// `GET /transfer/{id}`
pub async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TransferResponse>, AppError> {
    let id = parse_id(&id)?;
    let listing = state
        .directory
        .list_files(&id, header_str(&headers, PASSWORD_HEADER))
        .await
        .map_err(|err| AppError::from_transfer(err, "Failed to list files"))?;
    if listing.is_unknown() {
        return Err(AppError::not_found("Transfer not found"));
    }

    Ok(Json(TransferResponse {
        name: listing.metadata.and_then(|m| m.name),
        files: listing.files,
    }))
}

/// `GET /transfer/{id}/zip`
///
/// Every check runs before the first byte; after that a failure can only
/// cut the stream.
pub async fn download_zip(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let plan = state
        .archive
        .prepare(&id, header_str(&headers, PASSWORD_HEADER))
        .await
        .map_err(|err| AppError::from_transfer(err, "Failed to initiate zip download"))?;

    let disposition = content_disposition(&plan.file_name);
    let body = Body::from_stream(state.archive.stream_plan(plan));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

/// `attachment` disposition with an ASCII fallback name and the exact
/// UTF-8 name.
fn content_disposition(file_name: &str) -> HeaderValue {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(file_name, URL_COMPONENT)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// `GET /download/{transferId}/{filename}`
///
/// Redirects to a short-lived read grant after the password check.
/// `filename` is the percent-encoded relative path.
pub async fn download_file(
    State(state): State<AppState>,
    Path((transfer_id, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Redirect, AppError> {
    if transfer_id.contains("..") || filename.contains("..") {
        return Err(AppError::bad_request("Invalid path"));
    }
    let id = parse_id(&transfer_id)?;
    let url = state
        .directory
        .resolve_download(&id, &filename, header_str(&headers, PASSWORD_HEADER))
        .await
        .map_err(|err| AppError::from_transfer(err, "Failed to generate download link"))?;
    Ok(Redirect::temporary(&url))
}

/// `DELETE /transfer/{id}`
///
/// Requires `Authorization: Bearer {admin token}`. Disabled when no token
/// is configured.
pub async fn delete_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "Transfer deletion is disabled",
        ));
    };
    let presented = header_str(&headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(expected) {
        return Err(AppError::unauthorized("Unauthorized"));
    }

    let id = parse_id(&id)?;
    let deleted = state
        .directory
        .delete(&id)
        .await
        .map_err(|err| AppError::from_transfer(err, "Failed to delete transfer"))?;

    Ok(Json(json!({ "success": true, "deleted": deleted })))
}
