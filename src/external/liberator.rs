//! Device-metadata service client.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Source of device metadata, consulted on every device connect.
#[async_trait]
pub trait DeviceMetadata: Send + Sync {
    async fn fetch_device(&self, device_name: &str) -> Result<Value>;
}

/// HTTP client for the liberator service.
pub struct Liberator {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl Liberator {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DeviceMetadata for Liberator {
    async fn fetch_device(&self, device_name: &str) -> Result<Value> {
        let url = format!("{}/v2/devices/{}", self.base_url, device_name);
        let resp = self.http.get(&url).bearer_auth(&self.token).send().await?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let detail = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            bail!(
                "unexpected response from liberator for device {}: status {}, error: {}",
                device_name,
                status,
                detail
            );
        }
        Ok(body)
    }
}
