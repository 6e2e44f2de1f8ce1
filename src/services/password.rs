//! Password gate: bcrypt hashing and verification for protected transfers.
//!
//! bcrypt is deliberately slow, so both operations run on the blocking pool.

use thiserror::Error;
use tokio::task;

use crate::errors::{TransferError, TransferResult};
use crate::models::transfer::TransferMetadata;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("password task failed: {0}")]
    Join(#[from] task::JoinError),
}

#[derive(Debug, Clone, Copy)]
pub struct PasswordGate {
    cost: u32,
}

impl Default for PasswordGate {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}

impl PasswordGate {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }

    pub async fn hash(&self, plaintext: &str) -> Result<String, GateError> {
        let plaintext = plaintext.to_owned();
        let cost = self.cost;
        let hashed = task::spawn_blocking(move || bcrypt::hash(plaintext, cost)).await??;
        Ok(hashed)
    }

    /// `false` for a wrong password. A hash that bcrypt cannot parse is an
    /// error, not a mismatch.
    pub async fn verify(&self, plaintext: &str, hash: &str) -> Result<bool, GateError> {
        let plaintext = plaintext.to_owned();
        let hash = hash.to_owned();
        let matched = task::spawn_blocking(move || bcrypt::verify(plaintext, &hash)).await??;
        Ok(matched)
    }

    /// Enforce the gate for a read path. Unprotected transfers (no metadata,
    /// or no hash) pass regardless of what was supplied.
    pub async fn check(
        &self,
        metadata: Option<&TransferMetadata>,
        password: Option<&str>,
    ) -> TransferResult<()> {
        let Some(hash) = metadata.and_then(|m| m.password_hash.as_deref()) else {
            return Ok(());
        };
        if hash.is_empty() {
            return Ok(());
        }
        let Some(password) = password.filter(|p| !p.is_empty()) else {
            return Err(TransferError::AuthRequired);
        };
        if self.verify(password, hash).await? {
            Ok(())
        } else {
            Err(TransferError::AuthInvalid)
        }
    }
}
