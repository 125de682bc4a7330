//! Device-facing session loop.
//!
//! Turns a device socket into internal lifecycle events and routes its
//! telemetry onto the broker. Cloud-side state initialization happens in
//! the handlers reacting to [`ConnectEvent`]; the gateway itself only
//! validates the CONNECT, fetches metadata, and rebroadcasts packets.

use crate::broker::session::packet_name;
use crate::broker::{
    Broker, ConnectEvent, DisconnectEvent, Message, Session, SubscribeStatus, Subscriber,
    DEVICE_CONNECT_TOPIC, DEVICE_DISCONNECT_TOPIC,
};
use crate::external::DeviceMetadata;
use crate::store::FormationStore;
use mqttbytes::v4::Packet;
use mqttbytes::QoS;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct DeviceGateway {
    broker: Arc<Broker>,
    store: Arc<FormationStore>,
    metadata: Arc<dyn DeviceMetadata>,
}

/// The CONNECT username: either a bare formation id or a JSON document.
#[derive(Debug, Deserialize)]
struct Credentials {
    #[serde(default)]
    formation_id: String,
    #[serde(default)]
    ip_address: Option<String>,
}

impl DeviceGateway {
    pub fn new(
        broker: Arc<Broker>,
        store: Arc<FormationStore>,
        metadata: Arc<dyn DeviceMetadata>,
    ) -> Self {
        Self {
            broker,
            store,
            metadata,
        }
    }

    pub async fn handle_connection(&self, session: Arc<Session>) {
        let connect = match session.handshake().await {
            Ok(c) => c,
            Err(e) => {
                if !e.is_disconnect() {
                    tracing::warn!(peer = %session.peer(), error = %e, "device handshake failed");
                }
                session.close().await;
                return;
            }
        };

        let device_name = connect.client_id.clone();
        let username = connect
            .login
            .as_ref()
            .map(|l| l.username.clone())
            .unwrap_or_default();
        let creds = parse_credentials(&username);

        if creds.formation_id.is_empty() {
            tracing::warn!(
                peer = %session.peer(),
                device = %device_name,
                "CONNECT packet is missing a formation id, closing connection"
            );
            session.close().await;
            return;
        }

        let device_info = match self.metadata.fetch_device(&device_name).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(device = %device_name, error = %e, "device metadata fetch failed, closing connection");
                session.close().await;
                return;
            }
        };

        self.store.add_device(&device_name, &creds.formation_id);

        let event = ConnectEvent {
            formation_id: creds.formation_id.clone(),
            device_name: device_name.clone(),
            device_info,
            ip_address: creds.ip_address,
        };
        self.broker
            .publish(DEVICE_CONNECT_TOPIC, Message::Connect(Arc::new(event)))
            .await;

        tracing::info!(device = %device_name, formation = %creds.formation_id, "device connected");

        let torn_down = AtomicBool::new(false);
        self.run_loop(&session, &device_name).await;
        self.teardown(&torn_down, &session, &creds.formation_id, &device_name)
            .await;
    }

    async fn run_loop(&self, session: &Arc<Session>, device_name: &str) {
        let subscriber = Subscriber::session(session.clone());
        loop {
            let packet = match session.read().await {
                Ok(p) => p,
                Err(e) => {
                    if !e.is_disconnect() {
                        tracing::warn!(device = %device_name, error = %e, "device read failed");
                    }
                    return;
                }
            };

            match packet {
                Packet::PingReq => {
                    if session.send_pingresp().await.is_err() {
                        return;
                    }
                }
                Packet::Publish(p) => {
                    if p.qos != QoS::AtMostOnce {
                        tracing::warn!(device = %device_name, "QoS above 0 is unsupported, closing connection");
                        return;
                    }
                    if is_internal(&p.topic) {
                        continue;
                    }
                    self.broker.publish(&p.topic, Message::Bytes(p.payload)).await;
                }
                Packet::Subscribe(s) => {
                    if self.broker.handle_subscribe_packet(s, session, true).await
                        == SubscribeStatus::Evicted
                    {
                        return;
                    }
                }
                Packet::Unsubscribe(u) => {
                    self.broker.unsubscribe_all(&u, &subscriber).await;
                    if session.send_unsuback(u.pkid).await.is_err() {
                        return;
                    }
                }
                Packet::Disconnect => return,
                other => {
                    tracing::debug!(
                        device = %device_name,
                        packet = packet_name(&other),
                        "ignoring unsupported packet"
                    );
                }
            }
        }
    }

    /// Idempotent teardown: exactly one broker removal, one socket close,
    /// and one DisconnectEvent, even if the DISCONNECT and I/O-error paths
    /// race.
    async fn teardown(
        &self,
        torn_down: &AtomicBool,
        session: &Arc<Session>,
        formation_id: &str,
        device_name: &str,
    ) {
        if torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let subscriber = Subscriber::session(session.clone());
        self.broker.remove(&subscriber).await;
        session.close().await;

        let event = DisconnectEvent {
            formation_id: formation_id.to_string(),
            device_name: device_name.to_string(),
        };
        self.broker
            .publish(DEVICE_DISCONNECT_TOPIC, Message::Disconnect(Arc::new(event)))
            .await;

        tracing::info!(device = %device_name, "device disconnected");
    }
}

fn parse_credentials(username: &str) -> Credentials {
    match serde_json::from_str::<Credentials>(username) {
        Ok(creds) => creds,
        Err(_) => Credentials {
            formation_id: username.trim().to_string(),
            ip_address: None,
        },
    }
}

fn is_internal(topic: &str) -> bool {
    topic
        .strip_prefix('/')
        .unwrap_or(topic)
        .starts_with("$SYS/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_may_be_a_bare_formation_id() {
        let creds = parse_credentials("00000000-0000-0000-0000-000000000001");
        assert_eq!(creds.formation_id, "00000000-0000-0000-0000-000000000001");
        assert!(creds.ip_address.is_none());
    }

    #[test]
    fn username_may_be_a_json_document() {
        let creds = parse_credentials(r#"{"formation_id": "F", "ip_address": "23.23.23.23"}"#);
        assert_eq!(creds.formation_id, "F");
        assert_eq!(creds.ip_address.as_deref(), Some("23.23.23.23"));
    }

    #[test]
    fn empty_usernames_have_no_formation() {
        assert!(parse_credentials("").formation_id.is_empty());
        assert!(parse_credentials("{}").formation_id.is_empty());
    }
}
