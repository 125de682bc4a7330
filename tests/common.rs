//! Common test harness utilities for integration tests.
//!
//! Provides an in-process broker/gateway pair bound to ephemeral ports, a
//! raw MQTT test client, a recording message handler, and stubbed external
//! collaborators.

// Not all test files use all helpers; silence dead_code warnings for unused
// exports.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mqttbytes::v4::{
    self, Connect, Login, Packet, Publish, Subscribe, SubscribeFilter, Unsubscribe,
};
use mqttbytes::{Protocol, QoS};
use parking_lot::Mutex;
use serde_json::Value;
use spire::broker::{Broker, Message, MessageHandler, Subscriber};
use spire::external::{AuditRow, AuditSink, DeviceMetadata};
use spire::gateway::DeviceGateway;
use spire::handlers::stations::OuiDb;
use spire::handlers::{register_all, HandlerContext};
use spire::net::Server;
use spire::store::FormationStore;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves canned metadata for every device.
pub struct StubMetadata(pub Value);

#[async_trait]
impl DeviceMetadata for StubMetadata {
    async fn fetch_device(&self, _device_name: &str) -> Result<Value> {
        Ok(self.0.clone())
    }
}

/// Collects audit rows in memory.
#[derive(Default)]
pub struct RecordingSink {
    rows: Mutex<Vec<AuditRow>>,
}

impl RecordingSink {
    pub fn rows(&self) -> Vec<AuditRow> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn put_row(&self, row: AuditRow) -> Result<()> {
        self.rows.lock().push(row);
        Ok(())
    }
}

/// In-process subscriber that forwards deliveries to a channel.
pub struct Recorder {
    tx: mpsc::UnboundedSender<(String, Message)>,
}

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<(String, Message)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), rx)
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle_message(&self, topic: &str, message: Message) -> Result<()> {
        let _ = self.tx.send((topic.to_string(), message));
        Ok(())
    }
}

/// A broker + gateway wired like production, with stubbed collaborators and
/// ephemeral listeners.
pub struct Harness {
    pub broker: Arc<Broker>,
    pub store: Arc<FormationStore>,
    pub audit: Arc<RecordingSink>,
    pub devices_addr: SocketAddr,
    pub control_addr: SocketAddr,
}

impl Harness {
    pub async fn start(metadata: Value) -> Self {
        let broker = Arc::new(Broker::new(true));
        let store = Arc::new(FormationStore::new());
        let audit = Arc::new(RecordingSink::default());
        let metadata: Arc<dyn DeviceMetadata> = Arc::new(StubMetadata(metadata));

        let ctx = HandlerContext {
            broker: broker.clone(),
            store: store.clone(),
            audit: audit.clone(),
            crash: None,
            oui: Arc::new(OuiDb::empty()),
        };
        register_all(&ctx).await;

        let gateway = Arc::new(DeviceGateway::new(broker.clone(), store.clone(), metadata));

        let idle = Duration::from_secs(30);
        let devices = Server::bind("127.0.0.1:0", idle).await.expect("bind devices");
        let control = Server::bind("127.0.0.1:0", idle).await.expect("bind control");
        let devices_addr = devices.local_addr().expect("devices addr");
        let control_addr = control.local_addr().expect("control addr");

        tokio::spawn(devices.run(move |session| {
            let gateway = gateway.clone();
            async move { gateway.handle_connection(session).await }
        }));

        let control_broker = broker.clone();
        tokio::spawn(control.run(move |session| {
            let broker = control_broker.clone();
            async move { broker.handle_connection(session).await }
        }));

        Self {
            broker,
            store,
            audit,
            devices_addr,
            control_addr,
        }
    }

    /// Subscribe an in-process recorder on a pattern.
    pub async fn record(&self, pattern: &str) -> mpsc::UnboundedReceiver<(String, Message)> {
        let (handler, rx) = recorder();
        self.broker
            .subscribe(pattern, Subscriber::handler(handler))
            .await;
        rx
    }
}

/// Minimal raw MQTT 3.1.1 client for driving the listeners.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    pending: VecDeque<Publish>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, client_id: &str, username: Option<&str>) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut client = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            pending: VecDeque::new(),
        };

        let connect = Connect {
            protocol: Protocol::V4,
            keep_alive: 60,
            client_id: client_id.to_string(),
            clean_session: true,
            last_will: None,
            login: username.map(|user| Login {
                username: user.to_string(),
                password: String::new(),
            }),
        };
        client.send(|buf| connect.write(buf)).await;

        match client.read_packet().await {
            Packet::ConnAck(_) => {}
            other => panic!("expected CONNACK, got {other:?}"),
        }
        client
    }

    pub async fn subscribe(&mut self, topics: &[&str]) {
        let sub = Subscribe {
            pkid: 1,
            filters: topics
                .iter()
                .map(|topic| SubscribeFilter {
                    path: (*topic).to_string(),
                    qos: QoS::AtMostOnce,
                })
                .collect(),
        };
        self.send(|buf| sub.write(buf)).await;

        loop {
            match self.read_packet().await {
                Packet::SubAck(_) => return,
                Packet::Publish(p) => self.pending.push_back(p),
                other => panic!("expected SUBACK, got {other:?}"),
            }
        }
    }

    /// Subscribe with a QoS the broker rejects; no SUBACK is expected.
    pub async fn subscribe_with_qos(&mut self, topic: &str, qos: QoS) {
        let sub = Subscribe {
            pkid: 1,
            filters: vec![SubscribeFilter {
                path: topic.to_string(),
                qos,
            }],
        };
        self.send(|buf| sub.write(buf)).await;
    }

    pub async fn unsubscribe(&mut self, topics: &[&str]) {
        let unsub = Unsubscribe {
            pkid: 2,
            topics: topics.iter().map(|t| (*t).to_string()).collect(),
        };
        self.send(|buf| unsub.write(buf)).await;

        loop {
            match self.read_packet().await {
                Packet::UnsubAck(_) => return,
                Packet::Publish(p) => self.pending.push_back(p),
                other => panic!("expected UNSUBACK, got {other:?}"),
            }
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8]) {
        let packet = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.to_string(),
            pkid: 0,
            payload: Bytes::copy_from_slice(payload),
        };
        self.send(|buf| packet.write(buf)).await;
    }

    /// Next PUBLISH delivered to this client.
    pub async fn next_publish(&mut self) -> (String, Bytes) {
        if let Some(p) = self.pending.pop_front() {
            return (p.topic, p.payload);
        }
        loop {
            match self.read_packet().await {
                Packet::Publish(p) => return (p.topic, p.payload),
                Packet::PingResp => {}
                other => panic!("expected PUBLISH, got {other:?}"),
            }
        }
    }

    /// Next PUBLISH, or None if nothing arrives within the window.
    pub async fn try_next_publish(&mut self, window: Duration) -> Option<(String, Bytes)> {
        if let Some(p) = self.pending.pop_front() {
            return Some((p.topic, p.payload));
        }
        match timeout(window, self.next_publish()).await {
            Ok(res) => Some(res),
            Err(_) => None,
        }
    }

    /// Wait until the broker closes the connection.
    pub async fn expect_close(&mut self) {
        loop {
            match v4::read(&mut self.buf, 1024 * 1024) {
                Ok(Packet::Publish(p)) => self.pending.push_back(p),
                Ok(_) => {}
                Err(mqttbytes::Error::InsufficientBytes(_)) => {
                    let n = timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buf))
                        .await
                        .expect("timed out waiting for close")
                        .expect("read");
                    if n == 0 {
                        return;
                    }
                }
                Err(e) => panic!("protocol error: {e:?}"),
            }
        }
    }

    /// Drop the TCP connection without a DISCONNECT packet.
    pub async fn abort(mut self) {
        let _ = self.stream.shutdown().await;
    }

    async fn send<F>(&mut self, encode: F)
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    {
        let mut buf = BytesMut::new();
        encode(&mut buf).expect("encode packet");
        self.stream.write_all(&buf).await.expect("write packet");
    }

    async fn read_packet(&mut self) -> Packet {
        loop {
            match v4::read(&mut self.buf, 1024 * 1024) {
                Ok(packet) => return packet,
                Err(mqttbytes::Error::InsufficientBytes(_)) => {
                    let n = timeout(READ_TIMEOUT, self.stream.read_buf(&mut self.buf))
                        .await
                        .expect("timed out waiting for a packet")
                        .expect("read");
                    assert!(n > 0, "connection closed while waiting for a packet");
                }
                Err(e) => panic!("protocol error: {e:?}"),
            }
        }
    }
}

/// Receive from a recorder channel with a timeout.
pub async fn recv(
    rx: &mut mpsc::UnboundedReceiver<(String, Message)>,
) -> (String, Message) {
    timeout(READ_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("recorder channel closed")
}
