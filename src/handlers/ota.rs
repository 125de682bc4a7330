//! OTA firmware-update state machine.
//!
//! Device-reported state arrives on `pylon/<d>/ota/state`; UI commands
//! arrive on `armada/<d>/ota/sysupgrade` and `armada/<d>/ota/cancel` and are
//! forwarded byte-identical to the corresponding `pylon/…` topics. Derived
//! state for the UI goes out on `matriarch/<d>/ota/state`.

use crate::broker::topic::parse_device_topic;
use crate::broker::{
    Broker, ConnectEvent, DisconnectEvent, Message, MessageHandler, SubscribeEvent, Subscriber,
    DEVICE_CONNECT_TOPIC, DEVICE_DISCONNECT_TOPIC, SUBSCRIBE_EVENT_TOPIC,
};
use crate::handlers::HandlerContext;
use crate::store::FormationStore;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const KEY: &str = "ota";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtaPhase {
    Downloading,
    Upgrading,
    Error,
    Cancelled,
    #[default]
    #[serde(other)]
    Default,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OtaState {
    pub state: OtaPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub yours: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mine: String,
}

impl OtaState {
    fn phase(phase: OtaPhase) -> Self {
        Self {
            state: phase,
            ..Self::default()
        }
    }
}

pub struct OtaHandler {
    broker: Arc<Broker>,
    store: Arc<FormationStore>,
}

pub async fn register(ctx: &HandlerContext) -> Arc<OtaHandler> {
    let handler = Arc::new(OtaHandler {
        broker: ctx.broker.clone(),
        store: ctx.store.clone(),
    });

    let sub = Subscriber::handler(handler.clone());
    ctx.broker.subscribe(DEVICE_CONNECT_TOPIC, sub.clone()).await;
    ctx.broker
        .subscribe(DEVICE_DISCONNECT_TOPIC, sub.clone())
        .await;
    ctx.broker.subscribe(SUBSCRIBE_EVENT_TOPIC, sub.clone()).await;
    ctx.broker.subscribe("pylon/+/ota/state", sub.clone()).await;
    ctx.broker
        .subscribe("armada/+/ota/sysupgrade", sub.clone())
        .await;
    ctx.broker.subscribe("armada/+/ota/cancel", sub).await;
    handler
}

#[async_trait]
impl MessageHandler for OtaHandler {
    async fn handle_message(&self, topic: &str, message: Message) -> Result<()> {
        match message {
            Message::Connect(cm) => self.on_connect(&cm).await,
            Message::Disconnect(dm) => self.on_disconnect(&dm).await,
            Message::Subscribe(se) => self.on_subscribe(&se).await,
            other => {
                let parsed = parse_device_topic(topic)
                    .ok_or_else(|| anyhow!("[ota] unparseable topic {}", topic))?;
                let payload = other
                    .as_bytes()
                    .ok_or_else(|| anyhow!("[ota] expected byte buffer on {}", topic))?
                    .clone();
                let device_name = parsed.device_name.to_string();

                match (parsed.service, parsed.path) {
                    ("pylon", "ota/state") => self.on_device_state(&device_name, &payload).await,
                    ("armada", "ota/sysupgrade") => {
                        self.on_sysupgrade(&device_name, payload).await
                    }
                    ("armada", "ota/cancel") => self.on_cancel(&device_name, payload).await,
                    _ => Ok(()),
                }
            }
        }
    }
}

impl OtaHandler {
    async fn on_connect(&self, cm: &ConnectEvent) -> Result<()> {
        let state = OtaState::default();
        self.store
            .put_device_state(&cm.formation_id, &cm.device_name, KEY, state.clone());
        self.publish_state(&cm.device_name, &state).await
    }

    /// A device losing its connection mid-download will not finish it; tell
    /// the UI. No state change is persisted, the device is gone.
    async fn on_disconnect(&self, dm: &DisconnectEvent) -> Result<()> {
        let state = self.store.get_device_state::<OtaState>(&dm.device_name, KEY);
        if state.map_or(false, |s| s.state == OtaPhase::Downloading) {
            let error = OtaState {
                state: OtaPhase::Error,
                error: "connection to device lost during download".to_string(),
                ..OtaState::default()
            };
            self.publish_state(&dm.device_name, &error).await?;
        }
        Ok(())
    }

    /// Re-emit the persisted state when someone subscribes to a device's
    /// OTA topic, so late subscribers don't wait for the next transition.
    async fn on_subscribe(&self, se: &SubscribeEvent) -> Result<()> {
        for topic in &se.topics {
            let Some(parsed) = parse_device_topic(topic) else {
                continue;
            };
            if parsed.service != "matriarch" || parsed.path != "ota/state" {
                continue;
            }
            let state = self
                .store
                .get_device_state::<OtaState>(parsed.device_name, KEY);
            if let Some(state) = state {
                self.publish_state(parsed.device_name, &state).await?;
            }
        }
        Ok(())
    }

    /// Device-reported transitions. Download progress updates are UI-only:
    /// the persisted state must keep recording that a download is in flight.
    async fn on_device_state(&self, device_name: &str, payload: &[u8]) -> Result<()> {
        let msg: OtaState = serde_json::from_slice(payload)?;

        if msg.state != OtaPhase::Downloading {
            let formation_id = self.store.formation_id(device_name).unwrap_or_default();
            self.store
                .put_device_state(&formation_id, device_name, KEY, msg.clone());
        }
        self.publish_state(device_name, &msg).await
    }

    async fn on_sysupgrade(&self, device_name: &str, payload: bytes::Bytes) -> Result<()> {
        let msg: Value = serde_json::from_slice(&payload)?;
        if msg.get("url").and_then(Value::as_str).is_none()
            || msg.get("sha256").and_then(Value::as_str).is_none()
        {
            bail!("corrupt sysupgrade message");
        }

        self.broker
            .publish(
                &format!("pylon/{device_name}/ota/sysupgrade"),
                Message::Bytes(payload),
            )
            .await;

        let state = OtaState::phase(OtaPhase::Downloading);
        let formation_id = self.store.formation_id(device_name).unwrap_or_default();
        self.store
            .put_device_state(&formation_id, device_name, KEY, state.clone());
        self.publish_state(device_name, &state).await
    }

    async fn on_cancel(&self, device_name: &str, payload: bytes::Bytes) -> Result<()> {
        self.broker
            .publish(
                &format!("pylon/{device_name}/ota/cancel"),
                Message::Bytes(payload),
            )
            .await;

        let state = OtaState::phase(OtaPhase::Cancelled);
        let formation_id = self.store.formation_id(device_name).unwrap_or_default();
        self.store
            .put_device_state(&formation_id, device_name, KEY, state.clone());
        self.publish_state(device_name, &state).await
    }

    async fn publish_state(&self, device_name: &str, state: &OtaState) -> Result<()> {
        self.broker
            .publish(
                &format!("matriarch/{device_name}/ota/state"),
                Message::Json(serde_json::to_value(state)?),
            )
            .await;
        Ok(())
    }
}
