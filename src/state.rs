//! Shared state handed to every handler.

use rand::RngCore;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;

use crate::{
    config::AppConfig,
    services::{
        archive::ArchiveBuilder,
        bandwidth::BandwidthLedger,
        directory::TransferDirectory,
        metadata_store::TransferMetadataStore,
        object_store::{StoreHandle, open_store},
        password::PasswordGate,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub store: StoreHandle,
    pub metadata: TransferMetadataStore,
    pub directory: TransferDirectory,
    pub archive: ArchiveBuilder,
    pub gate: PasswordGate,
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    /// Wire every service from configuration over an open pool.
    pub fn build(cfg: &AppConfig, db: Arc<SqlitePool>) -> Self {
        let secret = match &cfg.signing_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                warn!("TRANSFER_SIGNING_SECRET not set; grants will not survive a restart");
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };

        let store = open_store(cfg, db.clone(), secret);
        let metadata = TransferMetadataStore::new(db.clone(), store.store.clone());
        let gate = PasswordGate::new(cfg.bcrypt_cost);
        let directory = TransferDirectory::new(
            store.store.clone(),
            metadata.clone(),
            gate,
            BandwidthLedger::new(db.clone()),
            cfg.public_url.clone(),
        );
        let archive = ArchiveBuilder::new(directory.clone());

        Self {
            db,
            store,
            metadata,
            directory,
            archive,
            gate,
            admin_token: cfg.admin_token.as_deref().map(Arc::from),
        }
    }
}
