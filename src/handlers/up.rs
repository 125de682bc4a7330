//! Per-device up-state heartbeat.
//!
//! On connect a task publishes `{state: "up", timestamp}` to
//! `matriarch/<d>/up` immediately and every 30 seconds. Disconnect cancels
//! the task, which emits a final `{state: "down"}` before exiting.

use crate::broker::{
    Broker, ConnectEvent, DisconnectEvent, Message, MessageHandler, Subscriber,
    DEVICE_CONNECT_TOPIC, DEVICE_DISCONNECT_TOPIC,
};
use crate::handlers::HandlerContext;
use crate::store::FormationStore;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct UpHandler {
    broker: Arc<Broker>,
    store: Arc<FormationStore>,
}

pub async fn register(ctx: &HandlerContext) -> Arc<UpHandler> {
    let handler = Arc::new(UpHandler {
        broker: ctx.broker.clone(),
        store: ctx.store.clone(),
    });

    let sub = Subscriber::handler(handler.clone());
    ctx.broker.subscribe(DEVICE_CONNECT_TOPIC, sub.clone()).await;
    ctx.broker.subscribe(DEVICE_DISCONNECT_TOPIC, sub).await;
    handler
}

#[async_trait]
impl MessageHandler for UpHandler {
    async fn handle_message(&self, _topic: &str, message: Message) -> Result<()> {
        match message {
            Message::Connect(cm) => self.on_connect(&cm),
            Message::Disconnect(dm) => self.on_disconnect(&dm),
            _ => Ok(()),
        }
    }
}

impl UpHandler {
    fn on_connect(&self, cm: &ConnectEvent) -> Result<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.store
            .put_up_cancel(&cm.formation_id, &cm.device_name, cancel_tx);

        tokio::spawn(publish_up_state(
            self.broker.clone(),
            cm.device_name.clone(),
            cancel_rx,
        ));
        Ok(())
    }

    fn on_disconnect(&self, dm: &DisconnectEvent) -> Result<()> {
        match self.store.take_up_cancel(&dm.device_name) {
            Some(cancel) => {
                // The task may already have exited; nothing to do then.
                let _ = cancel.send(());
                Ok(())
            }
            None => bail!(
                "cannot cancel the up-state task for device {}",
                dm.device_name
            ),
        }
    }
}

async fn publish_up_state(
    broker: Arc<Broker>,
    device_name: String,
    mut cancel: oneshot::Receiver<()>,
) {
    let topic = format!("matriarch/{device_name}/up");

    let beat = |state: &'static str| {
        json!({
            "state": state,
            "timestamp": Utc::now().timestamp(),
        })
    };

    broker.publish(&topic, Message::Json(beat("up"))).await;

    loop {
        tokio::select! {
            _ = &mut cancel => {
                broker.publish(&topic, Message::Json(beat("down"))).await;
                return;
            }
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                broker.publish(&topic, Message::Json(beat("up"))).await;
            }
        }
    }
}
