//! Streaming packet-loss statistics.
//!
//! Every `pylon/<d>/wan/ping` message carries per-category sent/received
//! counters. The handler maintains a streaming mean of the observed loss
//! with a 12-hour half-life: on roll-over the sample count is halved (with
//! a floor of 1000 so a fresh device doesn't instantly saturate the mean).

use crate::broker::topic::parse_device_topic;
use crate::broker::{Broker, Message, MessageHandler, Subscriber};
use crate::handlers::{round, HandlerContext};
use crate::store::FormationStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const KEY: &str = "ping";

const RESET_INTERVAL_SECS: i64 = 12 * 3600;
const MIN_COUNT_AFTER_RESET: i64 = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingStats {
    #[serde(default)]
    pub sent: i64,
    #[serde(default)]
    pub received: i64,
    /// Samples folded into the streaming mean. In-memory only.
    #[serde(skip)]
    pub count: i64,
    #[serde(default)]
    pub loss_now: f64,
    #[serde(default, rename = "loss_24_hours")]
    pub loss_24_hours: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternetStats {
    #[serde(default)]
    pub ping: PingStats,
    #[serde(default)]
    pub dns: PingStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayStats {
    #[serde(default)]
    pub ping: PingStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelStats {
    #[serde(default)]
    pub ping: PingStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingState {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub internet: InternetStats,
    #[serde(default)]
    pub gateway: GatewayStats,
    #[serde(default)]
    pub tunnel: TunnelStats,
}

pub struct PingHandler {
    broker: Arc<Broker>,
    store: Arc<FormationStore>,
}

pub async fn register(ctx: &HandlerContext) -> Arc<PingHandler> {
    let handler = Arc::new(PingHandler {
        broker: ctx.broker.clone(),
        store: ctx.store.clone(),
    });
    ctx.broker
        .subscribe("pylon/+/wan/ping", Subscriber::handler(handler.clone()))
        .await;
    handler
}

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle_message(&self, topic: &str, message: Message) -> Result<()> {
        let payload = message
            .as_bytes()
            .ok_or_else(|| anyhow!("[ping] expected byte buffer on {}", topic))?;
        let msg: PingState = serde_json::from_slice(payload)?;

        let device_name = parse_device_topic(topic)
            .ok_or_else(|| anyhow!("[ping] unparseable topic {}", topic))?
            .device_name
            .to_string();

        let next = {
            let mut guard = self.store.write();
            let current = guard
                .get_device_state::<PingState>(&device_name, KEY)
                .map(|s| (*s).clone());
            let next = update_ping_state(current, msg, Utc::now());
            let formation_id = guard.formation_id(&device_name).unwrap_or_default();
            guard.put_device_state(&formation_id, &device_name, KEY, next.clone());
            next
        };

        self.broker
            .publish(
                &format!("matriarch/{device_name}/wan/ping"),
                Message::Json(serde_json::to_value(&next)?),
            )
            .await;
        Ok(())
    }
}

/// Fold one incoming message into the persisted state.
pub fn update_ping_state(
    current: Option<PingState>,
    msg: PingState,
    now: DateTime<Utc>,
) -> PingState {
    let mut state = current.unwrap_or_else(|| msg.clone());

    let reset = now.timestamp() - state.timestamp >= RESET_INTERVAL_SECS;
    if reset {
        state.timestamp = now.timestamp();
    }

    update_losses(
        &mut state.internet.ping,
        msg.internet.ping.sent,
        msg.internet.ping.received,
        reset,
    );
    update_losses(
        &mut state.internet.dns,
        msg.internet.dns.sent,
        msg.internet.dns.received,
        reset,
    );
    update_losses(
        &mut state.gateway.ping,
        msg.gateway.ping.sent,
        msg.gateway.ping.received,
        reset,
    );
    update_losses(
        &mut state.tunnel.ping,
        msg.tunnel.ping.sent,
        msg.tunnel.ping.received,
        reset,
    );

    state
}

/// Update one category's counters in place.
pub fn update_losses(stats: &mut PingStats, sent: i64, received: i64, reset: bool) {
    if received == 0 {
        stats.loss_now = 1.0;
    } else {
        stats.loss_now = round(1.0 - received as f64 / sent as f64, 2);
    }

    stats.loss_24_hours =
        (stats.loss_24_hours * stats.count as f64 + stats.loss_now) / (stats.count + 1) as f64;
    stats.loss_24_hours = round(stats.loss_24_hours, 2);

    stats.count += 1;

    if reset {
        stats.count /= 2;
        if stats.count < MIN_COUNT_AFTER_RESET {
            stats.count = MIN_COUNT_AFTER_RESET;
        }
    }

    stats.sent = sent;
    stats.received = received;
}
