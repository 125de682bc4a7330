//! Resolves the OS descriptor from device metadata on connect.

use crate::broker::{Message, MessageHandler, Subscriber, DEVICE_CONNECT_TOPIC};
use crate::handlers::HandlerContext;
use crate::store::FormationStore;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub const KEY: &str = "device_info";

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_os: String,
}

pub struct DeviceInfoHandler {
    store: Arc<FormationStore>,
}

pub async fn register(ctx: &HandlerContext) -> Arc<DeviceInfoHandler> {
    let handler = Arc::new(DeviceInfoHandler {
        store: ctx.store.clone(),
    });
    ctx.broker
        .subscribe(DEVICE_CONNECT_TOPIC, Subscriber::handler(handler.clone()))
        .await;
    handler
}

#[async_trait]
impl MessageHandler for DeviceInfoHandler {
    async fn handle_message(&self, _topic: &str, message: Message) -> Result<()> {
        if let Message::Connect(cm) = message {
            let info = DeviceInfo {
                device_os: device_os(&cm.device_info),
            };
            self.store
                .put_device_state(&cm.formation_id, &cm.device_name, KEY, info);
        }
        Ok(())
    }
}

/// Format `data.current_system_image` as
/// `<vendor>-<product>-<variant>-<int(version)>`. Missing or wrong-typed
/// fields collapse to `unknown`.
fn device_os(info: &Value) -> String {
    let sysimg = &info["data"]["current_system_image"];

    let vendor = sysimg["vendor"].as_str();
    let product = sysimg["product"].as_str();
    let variant = sysimg["variant"].as_str();
    let version = sysimg["version"].as_f64();

    match (vendor, product, variant, version) {
        (Some(vendor), Some(product), Some(variant), Some(version)) => {
            format!("{}-{}-{}-{}", vendor, product, variant, version as i64)
        }
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_the_os_descriptor() {
        let info = json!({
            "data": {
                "current_system_image": {
                    "vendor": "tplink",
                    "product": "archer-c7",
                    "variant": "lingrush",
                    "version": 44,
                }
            }
        });
        assert_eq!(device_os(&info), "tplink-archer-c7-lingrush-44");
    }

    #[test]
    fn missing_fields_collapse_to_unknown() {
        assert_eq!(device_os(&json!({})), "unknown");
        assert_eq!(device_os(&json!({"data": {}})), "unknown");

        let wrong_type = json!({
            "data": {
                "current_system_image": {
                    "vendor": "tplink",
                    "product": "archer-c7",
                    "variant": "lingrush",
                    "version": "44",
                }
            }
        });
        assert_eq!(device_os(&wrong_type), "unknown");
    }
}
