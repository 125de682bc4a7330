//! Append-only audit sink for device login events.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

/// One login row, keyed by day for downstream aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRow {
    pub ip: String,
    pub mac: String,
    pub timestamp: i64,
    pub day: i64,
    pub pylon_ip: String,
    pub pylon_name: String,
    pub action: String,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn put_row(&self, row: AuditRow) -> Result<()>;
}

/// Ships rows to the audit table through its HTTP row-writer endpoint.
pub struct HttpAuditSink {
    endpoint: String,
    table: String,
    http: reqwest::Client,
}

impl HttpAuditSink {
    pub fn new(endpoint: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            table: table.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn put_row(&self, row: AuditRow) -> Result<()> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "table": self.table, "item": row }))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!(
                "audit sink rejected row for {}: status {}",
                row.pylon_name,
                resp.status()
            );
        }
        Ok(())
    }
}

/// Fallback sink used when no endpoint is configured: rows are logged and
/// dropped. The sink is observational, so this keeps the broker loop intact.
#[derive(Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn put_row(&self, row: AuditRow) -> Result<()> {
        tracing::info!(
            pylon = %row.pylon_name,
            ip = %row.ip,
            mac = %row.mac,
            day = row.day,
            "audit sink not configured, dropping login row"
        );
        Ok(())
    }
}
