//! One connected MQTT peer.
//!
//! Every read and write is bounded by the idle deadline; exceeding it
//! surfaces as an error that terminates the session loop.

use crate::broker::message::Message;
use bytes::BytesMut;
use mqttbytes::v4::{
    self, ConnAck, Connect, ConnectReturnCode, Packet, PingResp, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use mqttbytes::QoS;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

const MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection closed by peer")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("idle timeout after {0:?}")]
    IdleTimeout(Duration),
    #[error("protocol error: {0:?}")]
    Protocol(mqttbytes::Error),
    #[error("expected a CONNECT packet from {peer}, got {got} instead")]
    UnexpectedPacket {
        peer: SocketAddr,
        got: &'static str,
    },
    #[error("payload encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SessionError {
    /// True for a clean peer close, which is not worth logging.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

struct SessionReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

/// An MQTT session over a TCP connection. Cheap to share behind an `Arc`;
/// the read loop and broker fan-out take the read and write halves
/// independently.
pub struct Session {
    peer: SocketAddr,
    idle_timeout: Duration,
    reader: Mutex<SessionReader>,
    writer: Mutex<OwnedWriteHalf>,
}

impl Session {
    pub fn new(stream: TcpStream, idle_timeout: Duration) -> Self {
        let peer = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        Self {
            peer,
            idle_timeout,
            reader: Mutex::new(SessionReader {
                half: read_half,
                buf: BytesMut::with_capacity(4096),
            }),
            writer: Mutex::new(write_half),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read one packet, pulling more bytes from the socket as needed. Each
    /// socket read is bounded by the idle deadline.
    pub async fn read(&self) -> Result<Packet, SessionError> {
        let mut reader = self.reader.lock().await;
        let SessionReader { half, buf } = &mut *reader;
        loop {
            match v4::read(buf, MAX_PACKET_SIZE) {
                Ok(packet) => return Ok(packet),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {
                    let n = match timeout(self.idle_timeout, half.read_buf(buf)).await {
                        Err(_) => return Err(SessionError::IdleTimeout(self.idle_timeout)),
                        Ok(res) => res?,
                    };
                    if n == 0 {
                        return Err(SessionError::Closed);
                    }
                }
                Err(e) => return Err(SessionError::Protocol(e)),
            }
        }
    }

    /// Read exactly one packet and fail unless it is a CONNECT, then
    /// acknowledge with a CONNACK.
    pub async fn handshake(&self) -> Result<Connect, SessionError> {
        let connect = match self.read().await? {
            Packet::Connect(c) => c,
            other => {
                return Err(SessionError::UnexpectedPacket {
                    peer: self.peer,
                    got: packet_name(&other),
                })
            }
        };

        let ack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        };
        self.write_with(|buf| ack.write(buf)).await?;
        Ok(connect)
    }

    pub async fn send_pingresp(&self) -> Result<(), SessionError> {
        self.write_with(|buf| PingResp.write(buf)).await
    }

    pub async fn send_suback(&self, pkid: u16, topic_count: usize) -> Result<(), SessionError> {
        let ack = SubAck {
            pkid,
            return_codes: (0..topic_count)
                .map(|_| SubscribeReasonCode::Success(QoS::AtMostOnce))
                .collect(),
        };
        self.write_with(|buf| ack.write(buf)).await
    }

    pub async fn send_unsuback(&self, pkid: u16) -> Result<(), SessionError> {
        let ack = UnsubAck { pkid };
        self.write_with(|buf| ack.write(buf)).await
    }

    /// Subscriber-capability adapter: JSON-encodes typed messages, passes
    /// byte payloads through, and emits a PUBLISH with QoS 0.
    pub async fn publish(&self, topic: &str, message: &Message) -> Result<(), SessionError> {
        let packet = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.to_string(),
            pkid: 0,
            payload: message.to_payload()?,
        };
        self.write_with(|buf| packet.write(buf)).await
    }

    /// Shut down the write half. Safe to call more than once.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn write_with<F>(&self, encode: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
    {
        let mut buf = BytesMut::new();
        encode(&mut buf).map_err(SessionError::Protocol)?;

        let mut writer = self.writer.lock().await;
        match timeout(self.idle_timeout, writer.write_all(&buf)).await {
            Err(_) => Err(SessionError::IdleTimeout(self.idle_timeout)),
            Ok(res) => Ok(res?),
        }
    }
}

pub(crate) fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}
