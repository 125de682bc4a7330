//! Forwards device login events to the audit sink.

use crate::broker::topic::parse_device_topic;
use crate::broker::{Message, MessageHandler, Subscriber, DEVICE_CONNECT_TOPIC};
use crate::external::{AuditRow, AuditSink};
use crate::handlers::{round, HandlerContext};
use crate::store::FormationStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Key used for storing/retrieving the public IP address of a device.
pub const FORWARDED_IP_KEY: &str = "forwarded_ip";

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Deserialize)]
struct AcceptMessage {
    ip: String,
    mac: String,
    timestamp: i64,
}

pub struct SentryHandler {
    store: Arc<FormationStore>,
    audit: Arc<dyn AuditSink>,
}

pub async fn register(ctx: &HandlerContext) -> Arc<SentryHandler> {
    let handler = Arc::new(SentryHandler {
        store: ctx.store.clone(),
        audit: ctx.audit.clone(),
    });

    let sub = Subscriber::handler(handler.clone());
    ctx.broker.subscribe(DEVICE_CONNECT_TOPIC, sub.clone()).await;
    ctx.broker.subscribe("pylon/+/sentry/accept", sub).await;
    handler
}

#[async_trait]
impl MessageHandler for SentryHandler {
    async fn handle_message(&self, topic: &str, message: Message) -> Result<()> {
        match message {
            Message::Connect(cm) => {
                self.store.put_device_state(
                    &cm.formation_id,
                    &cm.device_name,
                    FORWARDED_IP_KEY,
                    cm.ip_address.clone().unwrap_or_default(),
                );
                Ok(())
            }
            other => {
                let payload = other
                    .as_bytes()
                    .ok_or_else(|| anyhow!("[sentry] expected byte buffer on {}", topic))?;
                let msg: AcceptMessage = serde_json::from_slice(payload)?;

                let device_name = parse_device_topic(topic)
                    .ok_or_else(|| anyhow!("[sentry] unparseable topic {}", topic))?
                    .device_name
                    .to_string();

                let row = AuditRow {
                    ip: msg.ip,
                    mac: msg.mac,
                    timestamp: msg.timestamp,
                    day: day_of(msg.timestamp),
                    pylon_ip: self.forwarded_ip(&device_name),
                    pylon_name: device_name,
                    action: "logged_in".to_string(),
                };
                self.audit.put_row(row).await
            }
        }
    }
}

impl SentryHandler {
    fn forwarded_ip(&self, device_name: &str) -> String {
        self.store
            .get_device_state::<String>(device_name, FORWARDED_IP_KEY)
            .map_or_else(|| "unknown".to_string(), |ip| (*ip).clone())
    }
}

/// Midnight-aligned day bucket for a unix timestamp.
fn day_of(timestamp: i64) -> i64 {
    round(timestamp as f64 / SECONDS_PER_DAY, 0) as i64 * 86_400
}
