use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Body, Client, Response, header};
use serde_json::json;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use super::{FileProgress, FinalizeBody, LocalFile, TransferApi};
use crate::{
    handlers::transfer_handlers::{CREATOR_EMAIL_HEADER, SasResponse},
    models::transfer::TransferId,
};

/// [`TransferApi`] over HTTP against a running service.
pub struct HttpTransferClient {
    endpoint: String,
    http: Client,
}

impl HttpTransferClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let http = Client::builder().build().context("building http client")?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }
}

/// Turn a non-2xx response into an error carrying the server's message.
async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{} failed with {}: {}", what, status, body.trim());
}

#[async_trait]
impl TransferApi for HttpTransferClient {
    async fn upload_grant(&self, key: &str, content_type: &str) -> Result<String> {
        let url = format!("{}/sas", self.endpoint);
        let response = self
            .http
            .get(url)
            .query(&[("file", key), ("contentType", content_type)])
            .send()
            .await
            .context("grant request")?;
        let grant = ensure_success(response, "grant request")
            .await?
            .json::<SasResponse>()
            .await
            .context("grant response deserialization")?;
        Ok(grant.sas_token_url)
    }

    async fn upload(&self, grant_url: &str, file: &LocalFile, progress: FileProgress) -> Result<()> {
        let handle = File::open(&file.path)
            .await
            .with_context(|| format!("opening {}", file.path.display()))?;
        progress.reset();
        let stream = ReaderStream::new(handle).inspect_ok(move |chunk| progress.add(chunk.len() as u64));

        let response = self
            .http
            .put(grant_url)
            .header(header::CONTENT_TYPE, &file.content_type)
            .header(header::CONTENT_LENGTH, file.size)
            .body(Body::wrap_stream(stream))
            .send()
            .await
            .context("upload request")?;
        ensure_success(response, "upload").await?;
        Ok(())
    }

    async fn finalize(
        &self,
        id: &TransferId,
        body: &FinalizeBody,
        creator_email: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/transfer/{}/finalize", self.endpoint, id);
        let mut request = self.http.post(url).json(body);
        if let Some(email) = creator_email {
            request = request.header(CREATOR_EMAIL_HEADER, email);
        }
        let response = request.send().await.context("finalize request")?;
        ensure_success(response, "finalize").await?;
        Ok(())
    }

    async fn lock(&self, id: &TransferId, password: &str) -> Result<()> {
        let url = format!("{}/transfer/{}/lock", self.endpoint, id);
        let response = self
            .http
            .post(url)
            .json(&json!({ "password": password }))
            .send()
            .await
            .context("lock request")?;
        ensure_success(response, "lock").await?;
        Ok(())
    }
}
