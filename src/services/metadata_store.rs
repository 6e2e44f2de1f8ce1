//! Transfer metadata store.
//!
//! Rows live in the `transfers` table. Transfers created before the table
//! existed kept their document in a `{id}/.metadata.json` object; `get`
//! falls back to that object and copies it forward the first time it is
//! read. The fallback is the only place that knows about the legacy layout.

use chrono::Utc;
use futures::TryStreamExt;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    errors::TransferResult,
    models::transfer::{METADATA_OBJECT_NAME, MetadataPatch, TransferId, TransferMetadata},
    services::object_store::{ObjectStore, StoreError, read_small_object},
};

/// Legacy documents are a handful of fields; anything bigger is not one.
const LEGACY_METADATA_LIMIT: u64 = 64 * 1024;

/// Legacy ids shorter than this are test leftovers and never migrated.
const MIN_LEGACY_ID_LEN: usize = 5;

const SELECT_COLUMNS: &str =
    "created_at, password_hash, name, size_bytes, file_count, creator_email";

#[derive(Clone)]
pub struct TransferMetadataStore {
    db: Arc<SqlitePool>,
    store: Arc<dyn ObjectStore>,
}

/// Outcome of a bulk legacy migration run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl TransferMetadataStore {
    pub fn new(db: Arc<SqlitePool>, store: Arc<dyn ObjectStore>) -> Self {
        Self { db, store }
    }

    /// Merge the provided fields into the transfer's document, creating it
    /// (and stamping `created_at`) on first write.
    pub async fn upsert(
        &self,
        id: &TransferId,
        patch: MetadataPatch,
    ) -> TransferResult<TransferMetadata> {
        // Pull a legacy document forward first so the merge sees its fields.
        self.get(id).await?;

        let row = sqlx::query_as::<_, TransferMetadata>(&format!(
            r#"
            INSERT INTO transfers
                (id, created_at, password_hash, name, size_bytes, file_count, creator_email)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                password_hash = COALESCE(excluded.password_hash, transfers.password_hash),
                name = COALESCE(excluded.name, transfers.name),
                size_bytes = COALESCE(excluded.size_bytes, transfers.size_bytes),
                file_count = COALESCE(excluded.file_count, transfers.file_count),
                creator_email = COALESCE(excluded.creator_email, transfers.creator_email)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(Utc::now())
        .bind(patch.password_hash)
        .bind(patch.name)
        .bind(patch.size_bytes)
        .bind(patch.file_count)
        .bind(patch.creator_email)
        .fetch_one(&*self.db)
        .await?;

        debug!(transfer_id = %id, "stored transfer metadata");
        Ok(row)
    }

    /// The transfer's document, or `None` when it has never been finalized
    /// or locked.
    pub async fn get(&self, id: &TransferId) -> TransferResult<Option<TransferMetadata>> {
        if let Some(row) = self.fetch_row(id).await? {
            return Ok(Some(row));
        }
        let Some(legacy) = self.read_legacy(id).await? else {
            return Ok(None);
        };
        if self.insert_if_absent(id, &legacy).await? {
            info!(transfer_id = %id, "migrated legacy metadata on read");
        }
        // Another reader may have migrated concurrently; return what won.
        Ok(self.fetch_row(id).await?.or(Some(legacy)))
    }

    /// Remove the primary row. Returns whether a row existed.
    pub async fn delete(&self, id: &TransferId) -> TransferResult<bool> {
        let result = sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(id.as_str())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Copy every legacy document in the object store into the table.
    /// Existing rows are never overwritten and legacy objects are kept.
    pub async fn migrate_all_legacy(&self) -> TransferResult<MigrationReport> {
        let mut report = MigrationReport::default();
        let mut objects = self.store.list_by_prefix("");
        while let Some(object) = objects.try_next().await? {
            let Some((raw_id, rest)) = object.key.split_once('/') else {
                continue;
            };
            if rest != METADATA_OBJECT_NAME {
                continue;
            }
            if raw_id.len() < MIN_LEGACY_ID_LEN {
                debug!(key = %object.key, "skipping legacy metadata with short id");
                report.skipped += 1;
                continue;
            }
            let id = match TransferId::parse(raw_id) {
                Ok(id) => id,
                Err(_) => {
                    report.skipped += 1;
                    continue;
                }
            };
            match self.read_legacy(&id).await {
                Ok(Some(legacy)) => match self.insert_if_absent(&id, &legacy).await {
                    Ok(true) => report.migrated += 1,
                    Ok(false) => report.skipped += 1,
                    Err(err) => {
                        warn!(transfer_id = %id, error = %err, "failed to store legacy metadata");
                        report.failed += 1;
                    }
                },
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    warn!(transfer_id = %id, error = %err, "failed to read legacy metadata");
                    report.failed += 1;
                }
            }
        }
        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            "legacy metadata migration finished"
        );
        Ok(report)
    }

    async fn fetch_row(&self, id: &TransferId) -> TransferResult<Option<TransferMetadata>> {
        let row = sqlx::query_as::<_, TransferMetadata>(&format!(
            "SELECT {SELECT_COLUMNS} FROM transfers WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    async fn read_legacy(&self, id: &TransferId) -> TransferResult<Option<TransferMetadata>> {
        let key = id.metadata_key();
        let bytes = match read_small_object(&*self.store, &key, LEGACY_METADATA_LIMIT).await {
            Ok(bytes) => bytes,
            Err(StoreError::ObjectNotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let legacy = serde_json::from_slice::<TransferMetadata>(&bytes)?;
        Ok(Some(legacy))
    }

    async fn insert_if_absent(
        &self,
        id: &TransferId,
        meta: &TransferMetadata,
    ) -> TransferResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers
                (id, created_at, password_hash, name, size_bytes, file_count, creator_email)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(meta.created_at)
        .bind(&meta.password_hash)
        .bind(&meta.name)
        .bind(meta.size_bytes)
        .bind(meta.file_count)
        .bind(&meta.creator_email)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::test_pool, errors::TransferError, services::object_store::memory::MemoryObjectStore,
    };

    async fn setup(dir: &std::path::Path) -> (TransferMetadataStore, MemoryObjectStore) {
        let store = MemoryObjectStore::new();
        let db = test_pool(dir).await;
        (
            TransferMetadataStore::new(db, Arc::new(store.clone())),
            store,
        )
    }

    fn id(raw: &str) -> TransferId {
        TransferId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn upsert_merges_and_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, _) = setup(dir.path()).await;
        let t = id("transfer-1");

        let first = meta
            .upsert(
                &t,
                MetadataPatch {
                    name: Some("a.txt".into()),
                    size_bytes: Some(30),
                    file_count: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let second = meta
            .upsert(
                &t,
                MetadataPatch {
                    password_hash: Some("$2b$04$hash".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.name.as_deref(), Some("a.txt"));
        assert_eq!(second.size_bytes, Some(30));
        assert_eq!(second.file_count, Some(2));
        assert!(second.is_protected());
        assert_eq!(meta.get(&t).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn missing_transfer_has_no_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, _) = setup(dir.path()).await;
        assert_eq!(meta.get(&id("nothing-here")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn legacy_document_is_migrated_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, store) = setup(dir.path()).await;
        let t = id("legacy-1");
        store.insert(
            &t.metadata_key(),
            "application/json",
            r#"{"passwordHash":"$2b$04$legacy","name":"old.zip","createdAt":"2023-01-02T03:04:05Z"}"#,
        );

        let found = meta.get(&t).await.unwrap().unwrap();
        assert_eq!(found.password_hash.as_deref(), Some("$2b$04$legacy"));
        assert_eq!(found.created_at.to_rfc3339(), "2023-01-02T03:04:05+00:00");

        // The row now exists on its own; the legacy object is left alone.
        assert_eq!(meta.fetch_row(&t).await.unwrap(), Some(found));
        assert!(store.contains(&t.metadata_key()));
    }

    #[tokio::test]
    async fn upsert_on_legacy_transfer_keeps_legacy_password() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, store) = setup(dir.path()).await;
        let t = id("legacy-2");
        store.insert(
            &t.metadata_key(),
            "application/json",
            r#"{"passwordHash":"$2b$04$keepme"}"#,
        );

        let merged = meta
            .upsert(
                &t,
                MetadataPatch {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(merged.password_hash.as_deref(), Some("$2b$04$keepme"));
        assert_eq!(merged.name.as_deref(), Some("renamed"));
    }

    #[tokio::test]
    async fn malformed_legacy_document_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, store) = setup(dir.path()).await;
        let t = id("legacy-3");
        store.insert(&t.metadata_key(), "application/json", "{not json");

        let err = meta.get(&t).await.unwrap_err();
        assert!(matches!(err, TransferError::LegacyMetadata(_)));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, _) = setup(dir.path()).await;
        let t = id("transfer-2");
        meta.upsert(&t, MetadataPatch::default()).await.unwrap();
        assert!(meta.delete(&t).await.unwrap());
        assert!(!meta.delete(&t).await.unwrap());
        assert_eq!(meta.get(&t).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bulk_migration_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, store) = setup(dir.path()).await;
        store.insert("abcdef/.metadata.json", "application/json", r#"{"name":"one"}"#);
        store.insert("ghijkl/.metadata.json", "application/json", "garbage");
        store.insert("abc/.metadata.json", "application/json", r#"{"name":"short"}"#);
        store.insert("mnopqr/.metadata.json", "application/json", r#"{"name":"mnop"}"#);
        store.insert("mnopqr/file.txt", "text/plain", "data");
        store.insert("stuvwx/nested/.metadata.json", "application/json", "{}");

        meta.upsert(
            &id("mnopqr"),
            MetadataPatch {
                name: Some("already".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let report = meta.migrate_all_legacy().await.unwrap();
        assert_eq!(
            report,
            MigrationReport {
                migrated: 1,
                skipped: 2,
                failed: 1,
            }
        );
        let existing = meta.fetch_row(&id("mnopqr")).await.unwrap().unwrap();
        assert_eq!(existing.name.as_deref(), Some("already"));
        let migrated = meta.fetch_row(&id("abcdef")).await.unwrap().unwrap();
        assert_eq!(migrated.name.as_deref(), Some("one"));
    }
}
