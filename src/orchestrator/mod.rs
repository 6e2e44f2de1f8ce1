//! Upload orchestration: the sender side of a transfer.
//!
//! Every file gets its own upload grant and is pushed straight to the
//! object store, all files concurrently. Only when every upload succeeded
//! is the transfer finalized and, if a password was given, locked. A
//! failure or cancellation leaves already uploaded files where they are.

pub mod client;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub use tokio_util::sync::CancellationToken;

use crate::models::{object::DEFAULT_CONTENT_TYPE, transfer::TransferId};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// One file queued for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Display name, the file's own name without folders.
    pub name: String,
    /// Folder-preserving path inside the transfer, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    pub content_type: String,
}

/// Body of the finalize call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeBody {
    pub name: String,
    pub size: u64,
    pub file_count: u64,
}

/// Control-plane and data-plane calls the orchestrator needs.
#[async_trait]
pub trait TransferApi: Send + Sync {
    /// Upload grant URL for `key`.
    async fn upload_grant(&self, key: &str, content_type: &str) -> anyhow::Result<String>;

    /// PUT the file's bytes to `grant_url`, reporting bytes sent to
    /// `progress` as they go.
    async fn upload(
        &self,
        grant_url: &str,
        file: &LocalFile,
        progress: FileProgress,
    ) -> anyhow::Result<()>;

    async fn finalize(
        &self,
        id: &TransferId,
        body: &FinalizeBody,
        creator_email: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn lock(&self, id: &TransferId, password: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no files to send")]
    Empty,
    #[error("upload cancelled")]
    Cancelled,
    #[error("upload of `{path}` failed: {reason:#}")]
    Upload { path: String, reason: anyhow::Error },
    #[error("finalize failed: {0:#}")]
    Finalize(anyhow::Error),
    #[error("lock failed: {0:#}")]
    Lock(anyhow::Error),
}

/// Aggregate progress across every file of one transfer.
#[derive(Debug)]
pub struct UploadProgress {
    total: u64,
    sent: Vec<AtomicU64>,
}

impl UploadProgress {
    pub fn new(sizes: impl IntoIterator<Item = u64>) -> Arc<Self> {
        let sizes: Vec<u64> = sizes.into_iter().collect();
        Arc::new(Self {
            total: sizes.iter().sum(),
            sent: sizes.iter().map(|_| AtomicU64::new(0)).collect(),
        })
    }

    pub fn file(self: &Arc<Self>, index: usize) -> FileProgress {
        FileProgress {
            overall: Arc::clone(self),
            index,
        }
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Percentage in `[0, 100]`. An empty transfer counts as complete.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.sent_bytes() as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Byte counter for one file.
#[derive(Debug, Clone)]
pub struct FileProgress {
    overall: Arc<UploadProgress>,
    index: usize,
}

impl FileProgress {
    pub fn add(&self, bytes: u64) {
        if let Some(counter) = self.overall.sent.get(self.index) {
            counter.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Restart the count, e.g. when a request is retried from scratch.
    pub fn reset(&self) {
        if let Some(counter) = self.overall.sent.get(self.index) {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub files: Vec<LocalFile>,
    pub password: Option<String>,
    pub creator_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub transfer_id: TransferId,
    pub name: String,
    pub file_count: u64,
    pub total_bytes: u64,
}

impl SendOutcome {
    /// Recipient link for the transfer on `base_url`.
    pub fn share_url(&self, base_url: &str) -> String {
        format!("{}/share/{}", base_url.trim_end_matches('/'), self.transfer_id)
    }
}

/// Human label for a set of files: the first name, plus a count of the
/// rest.
pub fn transfer_name(files: &[LocalFile]) -> String {
    match files {
        [] => "Untitled Transfer".to_string(),
        [only] => only.name.clone(),
        [first, rest @ ..] => format!("{} + {} others", first.name, rest.len()),
    }
}

/// Upload `request.files` as a new transfer.
pub async fn send_transfer(
    api: &dyn TransferApi,
    request: SendRequest,
    cancel: CancellationToken,
) -> Result<SendOutcome, SendError> {
    let progress = UploadProgress::new(request.files.iter().map(|f| f.size));
    send_transfer_with_progress(api, request, cancel, progress).await
}

/// [`send_transfer`] with a caller-owned progress tracker.
pub async fn send_transfer_with_progress(
    api: &dyn TransferApi,
    request: SendRequest,
    cancel: CancellationToken,
    progress: Arc<UploadProgress>,
) -> Result<SendOutcome, SendError> {
    if request.files.is_empty() {
        return Err(SendError::Empty);
    }
    let id = TransferId::generate();
    info!(transfer_id = %id, files = request.files.len(), "starting transfer");

    let uploads = try_join_all(request.files.iter().enumerate().map(|(index, file)| {
        let key = id.object_key(&file.relative_path);
        let progress = progress.file(index);
        async move {
            let upload = async move {
                let grant = api
                    .upload_grant(&key, &file.content_type)
                    .await
                    .context("requesting upload grant")?;
                api.upload(&grant, file, progress).await?;
                debug!(key, "uploaded file");
                Ok::<_, anyhow::Error>(())
            };
            upload.await.map_err(|reason| SendError::Upload {
                path: file.relative_path.clone(),
                reason,
            })
        }
    }));
    tokio::pin!(uploads);

    let mut ticker = tokio::time::interval(PROGRESS_LOG_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            result = &mut uploads => {
                result?;
                break;
            }
            _ = cancel.cancelled() => {
                info!(transfer_id = %id, "transfer cancelled");
                return Err(SendError::Cancelled);
            }
            _ = ticker.tick() => {
                info!(transfer_id = %id, percent = progress.percent(), "uploading");
            }
        }
    }

    let name = transfer_name(&request.files);
    let total_bytes: u64 = request.files.iter().map(|f| f.size).sum();
    let body = FinalizeBody {
        name: name.clone(),
        size: total_bytes,
        file_count: request.files.len() as u64,
    };
    api.finalize(&id, &body, request.creator_email.as_deref())
        .await
        .map_err(SendError::Finalize)?;

    if let Some(password) = request.password.as_deref().filter(|p| !p.trim().is_empty()) {
        api.lock(&id, password).await.map_err(SendError::Lock)?;
    }

    info!(transfer_id = %id, "transfer complete");
    Ok(SendOutcome {
        transfer_id: id,
        name,
        file_count: request.files.len() as u64,
        total_bytes,
    })
}

/// Expand `paths` into upload entries. Directories are walked recursively
/// and their entries keep the directory's own name as the first segment.
pub async fn collect_files(paths: &[PathBuf]) -> anyhow::Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    for path in paths {
        let meta = fs::metadata(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?
            .to_string();
        if meta.is_dir() {
            walk_dir(path, &name, &mut files).await?;
        } else {
            files.push(local_file(path.clone(), name.clone(), name, meta.len()));
        }
    }
    Ok(files)
}

async fn walk_dir(root: &Path, root_name: &str, files: &mut Vec<LocalFile>) -> anyhow::Result<()> {
    let mut pending = vec![(root.to_path_buf(), root_name.to_string())];
    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry);
        }
        children.sort_by_key(|e| e.file_name());

        let mut subdirs = Vec::new();
        for entry in children {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let relative = format!("{prefix}/{name}");
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                subdirs.push((entry.path(), relative));
            } else if meta.is_file() {
                files.push(local_file(entry.path(), name, relative, meta.len()));
            }
        }
        // Reverse so the stack pops subdirectories in name order.
        pending.extend(subdirs.into_iter().rev());
    }
    Ok(())
}

fn local_file(path: PathBuf, name: String, relative_path: String, size: u64) -> LocalFile {
    let content_type = content_type_for(&name).to_string();
    LocalFile {
        path,
        name,
        relative_path,
        size,
        content_type,
    }
}

/// Content type from the file extension; unknown types are sent as raw
/// bytes.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
