//! Transfer directory: gated listing, single-file download resolution and
//! cascading delete.

use futures::TryStreamExt;
use percent_encoding::utf8_percent_encode;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    errors::{TransferError, TransferResult},
    models::transfer::{
        FileDescriptor, TransferId, TransferMetadata, is_metadata_object, validate_relative_path,
    },
    services::{
        bandwidth::BandwidthLedger,
        metadata_store::TransferMetadataStore,
        object_store::{ObjectStore, signing::URL_COMPONENT},
        password::PasswordGate,
    },
};

/// Result of a gated listing.
#[derive(Debug, Clone)]
pub struct TransferListing {
    pub metadata: Option<TransferMetadata>,
    pub files: Vec<FileDescriptor>,
}

impl TransferListing {
    /// Neither finalized nor holding any files.
    pub fn is_unknown(&self) -> bool {
        self.metadata.is_none() && self.files.is_empty()
    }
}

#[derive(Clone)]
pub struct TransferDirectory {
    store: Arc<dyn ObjectStore>,
    metadata: TransferMetadataStore,
    gate: PasswordGate,
    bandwidth: BandwidthLedger,
    public_url: String,
}

impl TransferDirectory {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metadata: TransferMetadataStore,
        gate: PasswordGate,
        bandwidth: BandwidthLedger,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metadata,
            gate,
            bandwidth,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn bandwidth(&self) -> &BandwidthLedger {
        &self.bandwidth
    }

    /// Proxy URL for one file. The download route re-checks the gate, so
    /// handing this out never bypasses a password.
    pub fn download_url(&self, id: &TransferId, relative_path: &str) -> String {
        format!(
            "{}/download/{}/{}",
            self.public_url,
            utf8_percent_encode(id.as_str(), URL_COMPONENT),
            utf8_percent_encode(relative_path, URL_COMPONENT)
        )
    }

    /// List the files of a transfer after enforcing its password.
    ///
    /// Files are returned in key order. The legacy metadata object and
    /// anything named like it never appear.
    pub async fn list_files(
        &self,
        id: &TransferId,
        password: Option<&str>,
    ) -> TransferResult<TransferListing> {
        let metadata = self.metadata.get(id).await?;
        self.gate.check(metadata.as_ref(), password).await?;

        let prefix = id.prefix();
        let mut files = Vec::new();
        let mut objects = self.store.list_by_prefix(&prefix);
        while let Some(object) = objects.try_next().await? {
            let Some(relative) = object.key.strip_prefix(&prefix) else {
                continue;
            };
            if relative.is_empty() || is_metadata_object(relative) {
                continue;
            }
            files.push(FileDescriptor {
                name: relative.to_string(),
                url: self.download_url(id, relative),
                size: object.size_bytes.max(0) as u64,
                content_type: object.content_type_or_default().to_string(),
            });
        }
        debug!(transfer_id = %id, count = files.len(), "listed transfer files");
        Ok(TransferListing { metadata, files })
    }

    /// Resolve a single-file download to a short-lived read grant.
    ///
    /// The path is validated before any store access. Bytes served are
    /// charged to the bandwidth ledger.
    pub async fn resolve_download(
        &self,
        id: &TransferId,
        relative_path: &str,
        password: Option<&str>,
    ) -> TransferResult<String> {
        validate_relative_path(relative_path)?;
        if is_metadata_object(relative_path) {
            return Err(TransferError::NotFound("File not found".into()));
        }

        let metadata = self.metadata.get(id).await?;
        self.gate.check(metadata.as_ref(), password).await?;

        let key = id.object_key(relative_path);
        let object = self
            .store
            .head(&key)
            .await?
            .ok_or_else(|| TransferError::NotFound("File not found".into()))?;
        let url = self.store.issue_download_grant(&key).await?;
        self.bandwidth.record(object.size_bytes.max(0) as u64).await;
        debug!(transfer_id = %id, key, "issued download grant");
        Ok(url)
    }

    /// Delete every object of the transfer and its metadata row. Returns
    /// the number of objects removed.
    pub async fn delete(&self, id: &TransferId) -> TransferResult<u64> {
        let deleted = self.store.delete_by_prefix(&id.prefix()).await?;
        self.metadata.delete(id).await?;
        info!(transfer_id = %id, deleted, "deleted transfer");
        Ok(deleted)
    }
}
