//! HTTP client for the external node lifecycle API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::info;

use warmpool_domain::lifecycle::NodeLifecycle;
use warmpool_domain::shared_kernel::{DomainError, Result};
use warmpool_shared::config::NodeApiConfig;

#[derive(Debug, Deserialize)]
struct CreateNodeResponse {
    id: String,
}

/// Error body returned by the API when something goes wrong.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorResponse {
    fn detail(self) -> String {
        match self.message {
            Some(message) if !message.is_empty() => format!("{}: {}", self.error, message),
            _ => self.error,
        }
    }
}

/// Client for `POST /api/nodes` and `DELETE /api/nodes/{id}`.
#[derive(Debug, Clone)]
pub struct NodeApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl NodeApiClient {
    /// Builds a client with the configured per-request timeout.
    pub fn new(config: &NodeApiConfig) -> std::result::Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl NodeLifecycle for NodeApiClient {
    async fn provision(&self) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/api/nodes", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            return Err(api_error("create node", status, response).await);
        }

        let body: CreateNodeResponse = response.json().await.map_err(transport_error)?;
        info!(node_id = %body.id, "node created");
        Ok(body.id)
    }

    async fn terminate(&self, node_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/api/nodes/{}", self.base_url, node_id))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !matches!(
            status,
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT
        ) {
            return Err(api_error("delete node", status, response).await);
        }

        info!(node_id, "node deletion requested");
        Ok(())
    }
}

fn transport_error(err: reqwest::Error) -> DomainError {
    DomainError::Lifecycle {
        message: err.to_string(),
    }
}

async fn api_error(operation: &str, status: StatusCode, response: reqwest::Response) -> DomainError {
    let detail = response
        .json::<ErrorResponse>()
        .await
        .map(ErrorResponse::detail)
        .unwrap_or_else(|_| "no error body".to_string());

    DomainError::Lifecycle {
        message: format!("{operation}: unexpected status {status}: {detail}"),
    }
}
