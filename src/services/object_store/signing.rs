//! Signed, time-limited grants for the local backend.
//!
//! A grant is a URL on this service (`/blob/{key}`) whose query string
//! carries the operation, an absolute expiry and an HMAC-SHA256 signature
//! over both plus the key (and the content type for uploads). The blob
//! handlers verify the grant before touching any bytes.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{fmt, sync::Arc};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Characters left as-is in a path segment or query value.
pub const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode an object key, keeping `/` between segments.
pub fn encode_key_path(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, URL_COMPONENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantOp {
    Get,
    Put,
}

impl fmt::Display for GrantOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GrantOp::Get => "get",
            GrantOp::Put => "put",
        })
    }
}

/// Query parameters of a grant URL.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantParams {
    pub op: GrantOp,
    pub expires: i64,
    #[serde(default)]
    pub content_type: Option<String>,
    pub signature: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrantError {
    #[error("grant has expired")]
    Expired,
    #[error("grant signature does not match")]
    BadSignature,
    #[error("grant does not allow this operation")]
    WrongOperation,
}

#[derive(Clone)]
pub struct GrantSigner {
    secret: Arc<[u8]>,
    public_url: String,
}

impl fmt::Debug for GrantSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantSigner")
            .field("public_url", &self.public_url)
            .finish_non_exhaustive()
    }
}

impl GrantSigner {
    pub fn new(secret: impl Into<Vec<u8>>, public_url: &str) -> Self {
        let secret: Vec<u8> = secret.into();
        Self {
            secret: secret.into(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build a grant URL for `op` on `key`, valid for `ttl` from `now`.
    pub fn sign_url(
        &self,
        op: GrantOp,
        key: &str,
        content_type: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> String {
        let expires = (now + ttl).timestamp();
        let signature = URL_SAFE_NO_PAD.encode(
            self.mac(op, key, expires, content_type)
                .finalize()
                .into_bytes(),
        );

        let mut url = format!(
            "{}/blob/{}?op={}&expires={}",
            self.public_url,
            encode_key_path(key),
            op,
            expires
        );
        if let Some(ct) = content_type {
            url.push_str("&content_type=");
            url.push_str(&utf8_percent_encode(ct, URL_COMPONENT).to_string());
        }
        url.push_str("&signature=");
        url.push_str(&signature);
        url
    }

    /// Check a presented grant for `expected` on `key` at `now`.
    pub fn verify(
        &self,
        expected: GrantOp,
        key: &str,
        params: &GrantParams,
        now: DateTime<Utc>,
    ) -> Result<(), GrantError> {
        if params.op != expected {
            return Err(GrantError::WrongOperation);
        }
        let presented = URL_SAFE_NO_PAD
            .decode(params.signature.as_bytes())
            .map_err(|_| GrantError::BadSignature)?;
        self.mac(params.op, key, params.expires, params.content_type.as_deref())
            .verify_slice(&presented)
            .map_err(|_| GrantError::BadSignature)?;
        if now.timestamp() > params.expires {
            return Err(GrantError::Expired);
        }
        Ok(())
    }

    fn mac(&self, op: GrantOp, key: &str, expires: i64, content_type: Option<&str>) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(
            format!("{op}\n{key}\n{expires}\n{}", content_type.unwrap_or_default()).as_bytes(),
        );
        mac
    }
}
