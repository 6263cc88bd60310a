//! Inference server client
//!
//! [`BackendClient`] is the only way the agent touches the inference
//! server's model repository. [`V2Client`] speaks the open inference (V2)
//! protocol over HTTP.

use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::debug;

/// Load, unload and infer against one inference server
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Load `model` (a backend name) into the server
    async fn load(&self, model: &str) -> BackendResult<()>;

    /// Unload `model` from the server
    async fn unload(&self, model: &str) -> BackendResult<()>;

    /// Run an inference request with a raw JSON payload
    async fn infer(&self, model: &str, payload: Bytes) -> BackendResult<Bytes>;

    /// Whether the server reports itself ready
    async fn ready(&self) -> BackendResult<bool>;
}

/// HTTP client for a V2 inference server
#[derive(Debug, Clone)]
pub struct V2Client {
    client: Client,
    base_url: String,
}

impl V2Client {
    pub fn new(base_url: &str, timeout: Duration) -> BackendResult<Self> {
        let client = Client::builder().timeout(timeout).no_proxy().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn repository_call(&self, operation: &'static str, model: &str) -> BackendResult<()> {
        let url = format!("{}/v2/repository/models/{}/{}", self.base_url, model, operation);
        debug!(model, operation, "Backend repository call");
        let response = self.client.post(&url).send().await?;
        check_status(operation, model, response).await.map(|_| ())
    }
}

async fn check_status(
    operation: &'static str,
    model: &str,
    response: Response,
) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    let model = model.to_string();
    if status.is_client_error() {
        Err(BackendError::Rejected {
            operation,
            model,
            status: status.as_u16(),
            message,
        })
    } else {
        Err(BackendError::Failed {
            operation,
            model,
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl BackendClient for V2Client {
    async fn load(&self, model: &str) -> BackendResult<()> {
        self.repository_call("load", model).await
    }

    async fn unload(&self, model: &str) -> BackendResult<()> {
        self.repository_call("unload", model).await
    }

    async fn infer(&self, model: &str, payload: Bytes) -> BackendResult<Bytes> {
        let url = format!("{}/v2/models/{}/infer", self.base_url, model);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;
        let response = check_status("infer", model, response).await?;
        Ok(response.bytes().await?)
    }

    async fn ready(&self) -> BackendResult<bool> {
        let url = format!("{}/v2/health/ready", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) if e.is_connect() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
