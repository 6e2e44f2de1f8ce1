use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

use crate::services::{object_store::StoreError, password::GateError};

/// Failures of the transfer core, shared by the directory, archive and
/// metadata services.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Password required")]
    AuthRequired,
    #[error("Invalid password")]
    AuthInvalid,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("object store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("archive stream aborted: {0}")]
    StreamAborted(io::Error),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("legacy metadata is malformed: {0}")]
    LegacyMetadata(#[from] serde_json::Error),
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotConfigured(reason) => TransferError::StoreUnavailable(reason),
            StoreError::ObjectNotFound(key) => {
                TransferError::NotFound(format!("object `{key}` not found"))
            }
            StoreError::InvalidKey => TransferError::BadRequest("Invalid path".into()),
            StoreError::InvalidContentType => {
                TransferError::BadRequest("Invalid content type".into())
            }
            other => TransferError::Store(other),
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    /// Map a core failure to a response, logging anything that would
    /// otherwise leak internals. `fallback` is the public 500 message.
    pub fn from_transfer(err: TransferError, fallback: &str) -> Self {
        match err {
            TransferError::AuthRequired | TransferError::AuthInvalid => {
                Self::unauthorized(err.to_string())
            }
            TransferError::NotFound(msg) => Self::not_found(msg),
            TransferError::BadRequest(msg) => Self::bad_request(msg),
            other => {
                tracing::error!(error = %other, "{}", fallback);
                Self::internal(fallback)
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        AppError::from_transfer(err, "Internal server error")
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "unhandled error");
        AppError::internal("Internal server error")
    }
}
