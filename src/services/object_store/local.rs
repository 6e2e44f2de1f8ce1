//! Local backend: object payloads on disk, object index in SQLite.
//!
//! Payloads are sharded beneath `base_path/{shard}/{shard}/{key}` using the
//! MD5 of the key. The `objects` table records content type, size and etag
//! so listing never has to walk the filesystem. Grants point back at this
//! service's `/blob/{key}` routes and are checked with [`GrantSigner`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{
    Stream, StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use md5::Context;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    GrantTtl, ObjectReader, ObjectStore, StoreError, StoreResult,
    signing::{GrantOp, GrantSigner},
};
use crate::models::object::ObjectInfo;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const LIST_PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool holding the object index.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    signer: GrantSigner,
    ttl: GrantTtl,
}

impl LocalObjectStore {
    pub fn new(db: Arc<SqlitePool>, base_path: PathBuf, signer: GrantSigner, ttl: GrantTtl) -> Self {
        Self {
            db,
            base_path,
            signer,
            ttl,
        }
    }

    pub fn signer(&self) -> &GrantSigner {
        &self.signer
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StoreError::InvalidKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StoreError::InvalidKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidKey);
        }
        Ok(())
    }

    /// Two-level shard identifiers for an object key: the first two bytes
    /// of MD5(key) as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified payload path. Parent directories may not exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_object(&self, key: &str) -> StoreResult<Option<ObjectInfo>> {
        let row = sqlx::query_as::<_, ObjectInfo>(
            "SELECT key, content_type, size_bytes, etag, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    /// Store a payload under `key` and upsert its index row.
    ///
    /// The body lands in a sibling temp file first, so a failed or
    /// abandoned upload never replaces an existing payload. Rename over
    /// the target is atomic and replaces it on every supported platform.
    pub async fn upload_object_stream<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StoreResult<ObjectInfo>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let dir = file_path
            .parent()
            .ok_or_else(|| StoreError::Io(io::Error::other("object path has no parent")))?;
        fs::create_dir_all(dir).await?;

        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let written = match spool(&tmp_path, stream).await {
            Ok(written) => fs::rename(&tmp_path, &file_path).await.map(|()| written),
            Err(err) => Err(err),
        };
        let (size_bytes, etag) = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };

        let object = self
            .index_object(key, content_type, size_bytes, &etag)
            .await
            .inspect_err(|err| warn!(key, error = %err, "payload stored but index write failed"))?;
        debug!(key, size_bytes, "stored object");
        Ok(object)
    }

    async fn index_object(
        &self,
        key: &str,
        content_type: Option<String>,
        size_bytes: i64,
        etag: &str,
    ) -> StoreResult<ObjectInfo> {
        let object = sqlx::query_as::<_, ObjectInfo>(
            r#"
            INSERT INTO objects (key, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING key, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(key)
        .bind(content_type)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;
        Ok(object)
    }

    /// Index row plus an opened file handle ready for streaming out.
    ///
    /// Returns ObjectNotFound if the row or the payload file is missing.
    pub async fn get_object_reader(&self, key: &str) -> StoreResult<(ObjectInfo, File)> {
        self.ensure_key_safe(key)?;
        let object = self
            .fetch_object(key)
            .await?
            .ok_or_else(|| StoreError::ObjectNotFound(key.to_string()))?;

        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::ObjectNotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    /// One page of the prefix listing, strictly after `after`.
    async fn list_page(&self, prefix: &str, after: Option<&str>) -> StoreResult<Vec<ObjectInfo>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT key, content_type, size_bytes, etag, last_modified \
             FROM objects WHERE instr(key, ",
        );
        builder.push_bind(prefix.to_string());
        builder.push(") = 1");

        if let Some(after) = after {
            builder.push(" AND key > ");
            builder.push_bind(after.to_string());
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(LIST_PAGE_SIZE as i64);

        let rows: Vec<ObjectInfo> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows)
    }

    /// Remove one object's payload and index row.
    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Drop the shard directories left empty by a delete, stopping at the
    /// first one that still holds something.
    async fn prune_empty_dirs(&self, from: &Path) {
        let inside_base = |dir: &&Path| dir.starts_with(&self.base_path) && *dir != self.base_path;
        for dir in from.ancestors().take_while(inside_base) {
            if let Err(err) = fs::remove_dir(dir).await {
                if !matches!(err.kind(), ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty) {
                    debug!(dir = %dir.display(), error = %err, "left directory in place");
                }
                break;
            }
        }
    }
}

/// Write `stream` to a fresh file at `path`, returning its size and MD5.
async fn spool<S>(path: &Path, stream: S) -> io::Result<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut file = File::create(path).await?;
    let mut digest = Context::new();
    let mut size_bytes: i64 = 0;
    let mut stream = std::pin::pin!(stream);
    while let Some(chunk) = stream.try_next().await? {
        digest.consume(&chunk);
        size_bytes += chunk.len() as i64;
        file.write_all(&chunk).await?;
    }
    file.sync_all().await?;
    Ok((size_bytes, format!("{:x}", digest.compute())))
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn issue_upload_grant(&self, key: &str, content_type: &str) -> StoreResult<String> {
        self.ensure_key_safe(key)?;
        Ok(self.signer.sign_url(
            GrantOp::Put,
            key,
            Some(content_type),
            self.ttl.upload,
            Utc::now(),
        ))
    }

    async fn issue_download_grant(&self, key: &str) -> StoreResult<String> {
        self.ensure_key_safe(key)?;
        Ok(self
            .signer
            .sign_url(GrantOp::Get, key, None, self.ttl.download, Utc::now()))
    }

    fn list_by_prefix<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, StoreResult<ObjectInfo>> {
        // State: None once the last short page has been returned.
        stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok::<_, StoreError>(None);
            };
            let page = self.list_page(prefix, after.as_deref()).await?;
            let next = if page.len() == LIST_PAGE_SIZE {
                page.last().map(|obj| Some(obj.key.clone()))
            } else {
                None
            };
            Ok(Some((
                stream::iter(page.into_iter().map(Ok::<_, StoreError>)),
                next,
            )))
        })
        .try_flatten()
        .boxed()
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>> {
        self.ensure_key_safe(key)?;
        self.fetch_object(key).await
    }

    async fn delete_by_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let keys: Vec<String> = self
            .list_by_prefix(prefix)
            .map_ok(|obj| obj.key)
            .try_collect()
            .await?;

        let mut deleted = 0;
        for key in keys {
            match self.delete_object(&key).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(key = %key, error = %err, "failed to delete object"),
            }
        }
        Ok(deleted)
    }

    async fn fetch_stream(&self, key: &str) -> StoreResult<ObjectReader> {
        let (_, file) = self.get_object_reader(key).await?;
        Ok(Box::pin(file))
    }

    /// Index query plus a write/read/delete round trip under `base_path`.
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM objects")
            .fetch_one(&*self.db)
            .await?;

        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let bytes = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if bytes? != b"readyz" {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "file content mismatch",
            )));
        }
        Ok(())
    }
}
