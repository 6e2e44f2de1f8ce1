//! Object store gateway.
//!
//! Transfer payloads never flow through the service on upload: callers get
//! a time-limited grant and talk to the store directly. The gateway also
//! lists, streams and deletes objects for the read paths. One backend is
//! selected at startup; nothing outside this module sees backend types.

pub mod local;
#[cfg(test)]
pub mod memory;
pub mod s3;
pub mod signing;

use async_trait::async_trait;
use chrono::Duration;
use futures::stream::BoxStream;
use sqlx::SqlitePool;
use std::{io, path::PathBuf, pin::Pin, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    config::{AppConfig, StoreBackend},
    models::object::ObjectInfo,
};
use local::LocalObjectStore;
use signing::GrantSigner;

/// Sequential reader over one object's bytes.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store is not configured: {0}")]
    NotConfigured(String),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid object key")]
    InvalidKey,
    #[error("invalid content type")]
    InvalidContentType,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("object store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How long issued grants stay valid.
#[derive(Debug, Clone, Copy)]
pub struct GrantTtl {
    pub upload: Duration,
    pub download: Duration,
}

impl GrantTtl {
    pub fn from_secs(upload: u64, download: u64) -> Self {
        Self {
            upload: Duration::seconds(upload as i64),
            download: Duration::seconds(download as i64),
        }
    }
}

/// Capability interface over a blob store.
///
/// Implementations do no filtering of their own: the reserved metadata
/// object and anything else under a prefix is returned as-is.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs and readiness output.
    fn backend(&self) -> &'static str;

    /// URL authorizing exactly one PUT of `key` with `content_type`.
    async fn issue_upload_grant(&self, key: &str, content_type: &str) -> StoreResult<String>;

    /// URL authorizing one GET of `key`.
    async fn issue_download_grant(&self, key: &str) -> StoreResult<String>;

    /// Lazily enumerate every object whose key starts with `prefix`,
    /// in key order.
    fn list_by_prefix<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, StoreResult<ObjectInfo>>;

    /// Object metadata, or `None` when absent.
    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>>;

    /// Best-effort removal of everything under `prefix`. Returns the
    /// number of objects removed.
    async fn delete_by_prefix(&self, prefix: &str) -> StoreResult<u64>;

    /// Open a sequential read stream over `key`.
    async fn fetch_stream(&self, key: &str) -> StoreResult<ObjectReader>;

    /// Cheap reachability probe for readiness checks.
    async fn ping(&self) -> StoreResult<()>;
}

/// Read a small object fully, refusing anything past `limit` bytes.
pub async fn read_small_object(
    store: &dyn ObjectStore,
    key: &str,
    limit: u64,
) -> StoreResult<Vec<u8>> {
    let reader = store.fetch_stream(key).await?;
    let mut buf = Vec::new();
    reader.take(limit + 1).read_to_end(&mut buf).await?;
    if buf.len() as u64 > limit {
        return Err(StoreError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("object `{key}` exceeds {limit} bytes"),
        )));
    }
    Ok(buf)
}

/// The selected backend, plus the local store when it is the one in use
/// (its grant URLs are served by this process).
#[derive(Clone)]
pub struct StoreHandle {
    pub store: Arc<dyn ObjectStore>,
    pub local: Option<LocalObjectStore>,
}

/// Build the configured backend.
pub fn open_store(cfg: &AppConfig, db: Arc<SqlitePool>, signing_secret: Vec<u8>) -> StoreHandle {
    let ttl = GrantTtl::from_secs(cfg.upload_grant_ttl_secs, cfg.download_grant_ttl_secs);
    match cfg.store_backend {
        StoreBackend::Local => {
            let signer = GrantSigner::new(signing_secret, &cfg.public_url);
            let local =
                LocalObjectStore::new(db, PathBuf::from(&cfg.storage_dir), signer, ttl);
            StoreHandle {
                store: Arc::new(local.clone()),
                local: Some(local),
            }
        }
        StoreBackend::S3 => StoreHandle {
            store: Arc::new(s3::S3ObjectStore::from_settings(&cfg.s3, ttl)),
            local: None,
        },
    }
}
