//! Crash reporter for device-side exceptions.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;

const NOTIFY_URL: &str = "https://notify.bugsnag.com";

/// One forwarded device exception with its metadata.
#[derive(Debug, Clone)]
pub struct CrashReport {
    pub error: String,
    pub context: String,
    pub hostname: String,
    pub os_version: String,
}

#[async_trait]
pub trait CrashReporter: Send + Sync {
    async fn notify(&self, report: CrashReport) -> Result<()>;
}

/// Bugsnag notify-API client.
pub struct Bugsnag {
    api_key: String,
    release_stage: String,
    http: reqwest::Client,
}

impl Bugsnag {
    pub fn new(api_key: impl Into<String>, release_stage: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            release_stage: release_stage.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CrashReporter for Bugsnag {
    async fn notify(&self, report: CrashReport) -> Result<()> {
        let payload = json!({
            "apiKey": self.api_key,
            "payloadVersion": "5",
            "notifier": {
                "name": "spire",
                "version": env!("CARGO_PKG_VERSION"),
                "url": "https://github.com/superscale/spire",
            },
            "events": [{
                "exceptions": [{
                    "errorClass": "DeviceException",
                    "message": report.error,
                }],
                "context": report.context,
                "severity": "error",
                "app": { "releaseStage": self.release_stage },
                "metaData": {
                    "device": {
                        "hostname": report.hostname,
                        "osVersion": report.os_version,
                    },
                },
            }],
        });

        let resp = self
            .http
            .post(NOTIFY_URL)
            .header("Bugsnag-Api-Key", &self.api_key)
            .header("Bugsnag-Payload-Version", "5")
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("crash reporter rejected event: status {}", resp.status());
        }
        Ok(())
    }
}
