//! Transfer identity, the metadata document, and file descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use crate::errors::{TransferError, TransferResult};

/// Name of the legacy metadata object kept beside a transfer's files.
pub const METADATA_OBJECT_NAME: &str = ".metadata.json";

const MAX_TRANSFER_ID_LEN: usize = 128;
const MAX_RELATIVE_PATH_LEN: usize = 1024;

/// Opaque transfer identifier, also the object key namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Validate an identifier coming from a URL or query string.
    ///
    /// Rejects empty ids, path separators, parent references and control
    /// characters so the id can be used as a key prefix as-is.
    pub fn parse(raw: &str) -> TransferResult<Self> {
        if raw.is_empty() {
            return Err(TransferError::BadRequest("Transfer ID is required".into()));
        }
        if raw.len() > MAX_TRANSFER_ID_LEN
            || raw.contains("..")
            || raw
                .chars()
                .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(TransferError::BadRequest("Invalid transfer ID".into()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key prefix shared by every object of this transfer.
    pub fn prefix(&self) -> String {
        format!("{}/", self.0)
    }

    pub fn object_key(&self, relative_path: &str) -> String {
        format!("{}/{}", self.0, relative_path)
    }

    pub fn metadata_key(&self) -> String {
        self.object_key(METADATA_OBJECT_NAME)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a folder-preserving relative path inside a transfer.
pub fn validate_relative_path(path: &str) -> TransferResult<()> {
    let invalid = || TransferError::BadRequest("Invalid path".into());
    if path.is_empty() || path.len() > MAX_RELATIVE_PATH_LEN {
        return Err(invalid());
    }
    if path.starts_with('/') || path.contains("..") {
        return Err(invalid());
    }
    if path.split('/').any(str::is_empty) {
        return Err(invalid());
    }
    if path.chars().any(|c| c == '\\' || c.is_control()) {
        return Err(invalid());
    }
    Ok(())
}

/// True for the legacy metadata object, wherever it sits in the tree.
pub fn is_metadata_object(relative_path: &str) -> bool {
    relative_path.rsplit('/').next() == Some(METADATA_OBJECT_NAME)
}

/// Split an upload key `{transferId}/{relativePath}` into its parts.
pub fn split_object_key(key: &str) -> TransferResult<(TransferId, String)> {
    let (id, relative) = key
        .split_once('/')
        .ok_or_else(|| TransferError::BadRequest("Invalid path".into()))?;
    let id = TransferId::parse(id)?;
    validate_relative_path(relative)?;
    Ok((id, relative.to_string()))
}

/// The per-transfer metadata document.
///
/// Serialized in camelCase, which is also the layout of the legacy
/// `.metadata.json` objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_email: Option<String>,
}

impl TransferMetadata {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            password_hash: None,
            name: None,
            size_bytes: None,
            file_count: None,
            creator_email: None,
        }
    }

    /// A transfer is protected iff it carries a non-empty password hash.
    pub fn is_protected(&self) -> bool {
        self.password_hash
            .as_deref()
            .is_some_and(|hash| !hash.is_empty())
    }
}

/// Fields to merge into a transfer's metadata; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub password_hash: Option<String>,
    pub name: Option<String>,
    pub size_bytes: Option<i64>,
    pub file_count: Option<i64>,
    pub creator_email: Option<String>,
}

/// Client-facing description of one file in a transfer. Derived on every
/// listing, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    /// Relative path inside the transfer, forward slashes.
    pub name: String,
    pub url: String,
    pub size: u64,
    pub content_type: String,
}
