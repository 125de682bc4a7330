//! Forwards device exceptions to the crash reporter.

use crate::broker::topic::parse_device_topic;
use crate::broker::{Message, MessageHandler, Subscriber};
use crate::external::{CrashReport, CrashReporter};
use crate::handlers::device_info::DeviceInfo;
use crate::handlers::HandlerContext;
use crate::store::FormationStore;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct ExceptionMessage {
    #[serde(default = "default_error")]
    error: String,
    #[serde(default = "default_context")]
    context: String,
}

fn default_error() -> String {
    "unknown exception on device".to_string()
}

fn default_context() -> String {
    "unknown originating topic".to_string()
}

pub struct ExceptionHandler {
    store: Arc<FormationStore>,
    crash: Option<Arc<dyn CrashReporter>>,
}

pub async fn register(ctx: &HandlerContext) -> Arc<ExceptionHandler> {
    let handler = Arc::new(ExceptionHandler {
        store: ctx.store.clone(),
        crash: ctx.crash.clone(),
    });
    ctx.broker
        .subscribe("pylon/+/exception", Subscriber::handler(handler.clone()))
        .await;
    handler
}

#[async_trait]
impl MessageHandler for ExceptionHandler {
    async fn handle_message(&self, topic: &str, message: Message) -> Result<()> {
        let Some(crash) = &self.crash else {
            bail!("crash reporter API key not set");
        };

        let payload = message
            .as_bytes()
            .ok_or_else(|| anyhow!("[exception] expected byte buffer on {}", topic))?;
        let msg: ExceptionMessage = serde_json::from_slice(payload)?;

        let device_name = parse_device_topic(topic)
            .ok_or_else(|| anyhow!("[exception] unparseable topic {}", topic))?
            .device_name
            .to_string();

        let os_version = self
            .store
            .get_device_state::<DeviceInfo>(&device_name, super::device_info::KEY)
            .map_or_else(|| "unknown".to_string(), |info| info.device_os.clone());

        crash
            .notify(CrashReport {
                error: msg.error,
                context: msg.context,
                hostname: device_name,
                os_version,
            })
            .await
    }
}
