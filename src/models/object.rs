//! Represents an object (file) held by the object store gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Content type reported when the store has none recorded.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata about a single stored blob, never its content bytes.
///
/// The key is the full object key, `{transferId}/{relativePath}` for
/// transfer payloads.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ObjectInfo {
    /// Full object key (path-like, forward slashes).
    pub key: String,

    /// Content type (MIME type) recorded at upload time.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 or backend-provided checksum.
    pub etag: Option<String>,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,
}

impl ObjectInfo {
    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}
