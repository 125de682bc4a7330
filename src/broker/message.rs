//! Message payloads and internal lifecycle events.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Topics with this prefix are reserved for internal use. Publish packets
/// arriving from the wire with these topics are dropped before fan-out.
pub const INTERNAL_TOPIC_PREFIX: &str = "$SYS";

/// Published after a SUBSCRIBE packet has been registered and acknowledged.
pub const SUBSCRIBE_EVENT_TOPIC: &str = "$SYS/subscribe";

/// Published when a device session completes its handshake.
pub const DEVICE_CONNECT_TOPIC: &str = "spire/devices/connect";

/// Published when a device session terminates.
pub const DEVICE_DISCONNECT_TOPIC: &str = "spire/devices/disconnect";

/// Payload delivered to subscribers. Wire publishes carry raw bytes; internal
/// emitters publish typed events or JSON values.
#[derive(Debug, Clone)]
pub enum Message {
    /// Raw payload from a PUBLISH packet.
    Bytes(Bytes),
    /// A derived state document destined for UI topics.
    Json(Value),
    Connect(Arc<ConnectEvent>),
    Disconnect(Arc<DisconnectEvent>),
    Subscribe(Arc<SubscribeEvent>),
}

impl Message {
    /// Encode for delivery over the wire. Byte payloads pass through
    /// untouched; everything else is JSON-encoded.
    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            Message::Bytes(b) => Ok(b.clone()),
            Message::Json(v) => Ok(Bytes::from(serde_json::to_vec(v)?)),
            Message::Connect(e) => Ok(Bytes::from(serde_json::to_vec(e.as_ref())?)),
            Message::Disconnect(e) => Ok(Bytes::from(serde_json::to_vec(e.as_ref())?)),
            Message::Subscribe(e) => Ok(Bytes::from(serde_json::to_vec(e.as_ref())?)),
        }
    }

    /// The raw bytes of a wire payload, if that is what this message is.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Message::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Emitted on `spire/devices/connect` after a device handshake succeeds.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectEvent {
    pub formation_id: String,
    pub device_name: String,
    /// Raw metadata document from the liberator service.
    pub device_info: Value,
    pub ip_address: Option<String>,
}

/// Emitted on `spire/devices/disconnect` when a device session ends.
#[derive(Debug, Clone, Serialize)]
pub struct DisconnectEvent {
    pub formation_id: String,
    pub device_name: String,
}

/// Emitted on `$SYS/subscribe` after a SUBSCRIBE packet has been registered.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeEvent {
    pub topics: Vec<String>,
}
