//! In-memory object store used by unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io::{self, Cursor},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio_util::io::StreamReader;

use super::{ObjectReader, ObjectStore, StoreError, StoreResult};
use crate::models::object::ObjectInfo;

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, (ObjectInfo, Bytes)>>>,
    broken: Arc<Mutex<HashSet<String>>>,
    cut: Arc<Mutex<HashMap<String, usize>>>,
    fetches: Arc<AtomicUsize>,
    unconfigured: bool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation reports a missing configuration.
    pub fn unconfigured() -> Self {
        Self {
            unconfigured: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, key: &str, content_type: &str, bytes: impl Into<Bytes>) {
        let bytes = bytes.into();
        let info = ObjectInfo {
            key: key.to_string(),
            content_type: Some(content_type.to_string()),
            size_bytes: bytes.len() as i64,
            etag: Some(format!("{:x}", md5::compute(&bytes))),
            last_modified: Utc::now(),
        };
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (info, bytes));
    }

    /// Keep the object listed but fail every attempt to read it, as if it
    /// vanished between listing and fetch.
    pub fn break_object(&self, key: &str) {
        self.broken.lock().unwrap().insert(key.to_string());
    }

    /// Open normally but fail the read after `after` bytes, like a
    /// connection dropped mid-transfer.
    pub fn cut_object(&self, key: &str, after: usize) {
        self.cut.lock().unwrap().insert(key.to_string(), after);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_configured(&self) -> StoreResult<()> {
        if self.unconfigured {
            return Err(StoreError::NotConfigured("memory store disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn issue_upload_grant(&self, key: &str, content_type: &str) -> StoreResult<String> {
        self.check_configured()?;
        Ok(format!("memory://put/{key}?content_type={content_type}"))
    }

    async fn issue_download_grant(&self, key: &str) -> StoreResult<String> {
        self.check_configured()?;
        Ok(format!("memory://get/{key}"))
    }

    fn list_by_prefix<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, StoreResult<ObjectInfo>> {
        if let Err(err) = self.check_configured() {
            return stream::once(async move { Err(err) }).boxed();
        }
        let items: Vec<StoreResult<ObjectInfo>> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, (info, _))| Ok(info.clone()))
            .collect();
        stream::iter(items).boxed()
    }

    async fn head(&self, key: &str) -> StoreResult<Option<ObjectInfo>> {
        self.check_configured()?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(info, _)| info.clone()))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> StoreResult<u64> {
        self.check_configured()?;
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|key, _| !key.starts_with(prefix));
        Ok((before - objects.len()) as u64)
    }

    async fn fetch_stream(&self, key: &str) -> StoreResult<ObjectReader> {
        self.check_configured()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.broken.lock().unwrap().contains(key) {
            return Err(StoreError::ObjectNotFound(key.to_string()));
        }
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| StoreError::ObjectNotFound(key.to_string()))?;
        if let Some(&after) = self.cut.lock().unwrap().get(key) {
            let head = bytes.slice(..after.min(bytes.len()));
            let chunks = vec![Ok(head), Err(io::Error::other("connection reset"))];
            return Ok(Box::pin(StreamReader::new(stream::iter(chunks))));
        }
        Ok(Box::pin(Cursor::new(bytes)))
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_configured()
    }
}
