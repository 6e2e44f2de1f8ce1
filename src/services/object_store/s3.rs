//! S3-compatible backend built on `rust-s3`.
//!
//! Grants are presigned URLs, so clients talk to the bucket directly.
//! Upload grants sign the `Content-Type` header, so the PUT must carry the
//! type the grant was issued for. Listings come from `ListObjectsV2` one
//! page at a time and report no content type. When
//! the bucket or credentials are missing the store still comes up and every
//! request reports [`StoreError::NotConfigured`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use http::{HeaderMap, HeaderValue, header::CONTENT_TYPE};
use s3::{Bucket, Region, creds::Credentials, error::S3Error, serde_types::Object};
use std::io;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{GrantTtl, ObjectReader, ObjectStore, StoreError, StoreResult};
use crate::{config::S3Settings, models::object::ObjectInfo};

const PING_KEY: &str = ".transfer-store-ping";
const LIST_PAGE_SIZE: usize = 1000;

pub struct S3ObjectStore {
    bucket: Result<Box<Bucket>, String>,
    ttl: GrantTtl,
}

impl S3ObjectStore {
    pub fn from_settings(settings: &S3Settings, ttl: GrantTtl) -> Self {
        let bucket = Self::open_bucket(settings);
        if let Err(reason) = &bucket {
            warn!(%reason, "s3 backend selected but not usable; requests will fail");
        }
        Self { bucket, ttl }
    }

    fn open_bucket(settings: &S3Settings) -> Result<Box<Bucket>, String> {
        let name = settings
            .bucket
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| "no bucket configured".to_string())?;
        let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key)
        else {
            return Err("s3 credentials are not set".to_string());
        };
        let credentials = Credentials {
            access_key: Some(access_key.clone()),
            secret_key: Some(secret_key.clone()),
            security_token: None,
            session_token: None,
            expiration: None,
        };
        let region = match &settings.endpoint {
            Some(endpoint) => Region::Custom {
                region: settings.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => settings
                .region
                .parse()
                .map_err(|err| format!("parsing s3 region: {err}"))?,
        };
        let bucket = Bucket::new(name, region, credentials)
            .map_err(|err| format!("opening bucket `{name}`: {err}"))?;
        Ok(if settings.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        })
    }

    fn bucket(&self) -> StoreResult<&Bucket> {
        self.bucket
            .as_deref()
            .map_err(|reason| StoreError::NotConfigured(reason.clone()))
    }
}

fn backend_error(err: S3Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn is_not_found(err: &S3Error) -> bool {
    matches!(err, S3Error::HttpFailWithBody(404, _))
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|raw| {
        DateTime::parse_from_rfc3339(raw)
            .or_else(|_| DateTime::parse_from_rfc2822(raw))
            .ok()
    })
    .map(|dt| dt.with_timezone(&Utc))
    .unwrap_or_else(Utc::now)
}

fn object_info(object: Object) -> ObjectInfo {
    ObjectInfo {
        last_modified: parse_timestamp(Some(&object.last_modified)),
        key: object.key,
        content_type: None,
        size_bytes: object.size as i64,
        etag: object.e_tag.map(|e| e.trim_matches('"').to_string()),
    }
}

fn ttl_secs(ttl: chrono::Duration) -> u32 {
    ttl.num_seconds().clamp(1, u32::MAX as i64) as u32
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn backend(&self) -> &'static str {
        "s3"
    }

    async fn issue_upload_grant(&self, key: &str, content_type: &str) -> StoreResult<String> {
        let bucket = self.bucket()?;
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type).map_err(|_| StoreError::InvalidContentType)?,
        );
        bucket
            .presign_put(key, ttl_secs(self.ttl.upload), Some(headers), None)
            .await
            .map_err(backend_error)
    }

    async fn issue_download_grant(&self, key: &str) -> StoreResult<String> {
        let bucket = self.bucket()?;
        bucket
            .presign_get(key, ttl_secs(self.ttl.download), None)
            .await
            .map_err(backend_error)
    }

    fn list_by_prefix<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, StoreResult<ObjectInfo>> {
        // State: the continuation token of the next page, None when done.
        stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(token) = cursor else {
                return Ok::<_, StoreError>(None);
            };
            let bucket = self.bucket()?;
            let (page, _) = bucket
                .list_page(prefix.to_string(), None, token, None, Some(LIST_PAGE_SIZE))
                .await
                .map_err(backend_error)?;
            debug!(prefix, count = page.contents.len(), "listed s3 page");
            let next = page.next_continuation_token.map(Some);
            Ok(Some((
                stream::iter(page.contents.into_iter().map(|o| Ok(object_info(o)))),
                next,
            )))
        })
        .try_flatten()
        .boxed()
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>> {
        let bucket = self.bucket()?;
        match bucket.head_object(key).await {
            Ok((head, _)) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                content_type: head.content_type,
                size_bytes: head.content_length.unwrap_or(0),
                etag: head.e_tag.map(|e| e.trim_matches('"').to_string()),
                last_modified: parse_timestamp(head.last_modified.as_deref()),
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(backend_error(err)),
        }
    }

    async fn delete_by_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let bucket = self.bucket()?;
        let mut objects = self.list_by_prefix(prefix);
        let mut deleted = 0;
        while let Some(object) = objects.try_next().await? {
            match bucket.delete_object(&object.key).await {
                Ok(_) => deleted += 1,
                Err(err) => warn!(key = %object.key, error = %err, "failed to delete object"),
            }
        }
        Ok(deleted)
    }

    async fn fetch_stream(&self, key: &str) -> StoreResult<ObjectReader> {
        let bucket = self.bucket()?;
        let response = match bucket.get_object_stream(key).await {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => {
                return Err(StoreError::ObjectNotFound(key.to_string()));
            }
            Err(err) => return Err(backend_error(err)),
        };
        let body = response
            .bytes
            .map_err(|err| io::Error::other(err.to_string()));
        Ok(Box::pin(StreamReader::new(body)))
    }

    async fn ping(&self) -> StoreResult<()> {
        let bucket = self.bucket()?;
        match bucket.head_object(PING_KEY).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(backend_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::object::DEFAULT_CONTENT_TYPE;

    fn settings() -> S3Settings {
        S3Settings {
            bucket: Some("transfers".into()),
            region: "us-east-1".into(),
            endpoint: Some("http://127.0.0.1:9000".into()),
            access_key: Some("minio".into()),
            secret_key: Some("minio-secret".into()),
        }
    }

    #[tokio::test]
    async fn missing_bucket_fails_per_request() {
        let mut cfg = settings();
        cfg.bucket = None;
        let store = S3ObjectStore::from_settings(&cfg, GrantTtl::from_secs(60, 60));
        let err = store
            .issue_upload_grant("abc/file.txt", "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotConfigured(_)));
        assert!(matches!(store.ping().await, Err(StoreError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn missing_credentials_fail_per_request() {
        let mut cfg = settings();
        cfg.secret_key = None;
        let store = S3ObjectStore::from_settings(&cfg, GrantTtl::from_secs(60, 60));
        let listed: Vec<_> = store.list_by_prefix("abc/").collect().await;
        assert_eq!(listed.len(), 1);
        assert!(matches!(listed[0], Err(StoreError::NotConfigured(_))));
    }

    #[tokio::test]
    async fn presigned_upload_is_scoped_to_key() {
        let store = S3ObjectStore::from_settings(&settings(), GrantTtl::from_secs(900, 900));
        let url = store
            .issue_upload_grant("abc/report.pdf", "application/pdf")
            .await
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/transfers/abc/report.pdf?"));
        assert!(url.contains("X-Amz-Expires=900"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn presigned_upload_signs_the_content_type() {
        let store = S3ObjectStore::from_settings(&settings(), GrantTtl::from_secs(900, 900));
        let url = store
            .issue_upload_grant("abc/report.pdf", "application/pdf")
            .await
            .unwrap();
        assert!(url.contains("X-Amz-SignedHeaders=content-type%3Bhost"), "{url}");

        let err = store
            .issue_upload_grant("abc/report.pdf", "text/plain\nx-evil: 1")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidContentType));
    }

    #[test]
    fn listed_objects_leave_content_type_to_the_caller() {
        let info = object_info(Object {
            last_modified: "2024-05-01T10:00:00.000Z".into(),
            e_tag: Some("\"abc123\"".into()),
            storage_class: None,
            key: "t-1/a.txt".into(),
            owner: None,
            size: 42,
        });
        assert_eq!(info.key, "t-1/a.txt");
        assert_eq!(info.size_bytes, 42);
        assert_eq!(info.etag.as_deref(), Some("abc123"));
        assert_eq!(info.content_type_or_default(), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn timestamps_fall_back_to_now() {
        let parsed = parse_timestamp(Some("2024-05-01T10:00:00.000Z"));
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        let http = parse_timestamp(Some("Wed, 01 May 2024 10:00:00 GMT"));
        assert_eq!(http, parsed);
        let before = Utc::now();
        assert!(parse_timestamp(Some("garbage")) >= before);
    }
}
