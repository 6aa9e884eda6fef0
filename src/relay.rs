use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatus {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(StatusCode),
}

#[derive(Clone)]
pub struct RelayClient {
    client: Client,
    gpu_url: String,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(client: Client, upstream_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            gpu_url: format!("{}/api/gpu", upstream_url.trim_end_matches('/')),
            timeout,
        }
    }

    pub fn gpu_url(&self) -> &str {
        &self.gpu_url
    }

    pub async fn fetch_status(&self) -> Result<GpuStatus, RelayError> {
        let resp = self
            .client
            .get(&self.gpu_url)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Status(status));
        }
        Ok(resp.json::<GpuStatus>().await?)
    }
}
