//! Pub/sub broker: subscriber registry, publish fan-out, and the
//! control-facing session event loop.

pub mod message;
pub mod session;
pub mod subscriber;
pub mod topic;

pub use message::{
    ConnectEvent, DisconnectEvent, Message, SubscribeEvent, DEVICE_CONNECT_TOPIC,
    DEVICE_DISCONNECT_TOPIC, INTERNAL_TOPIC_PREFIX, SUBSCRIBE_EVENT_TOPIC,
};
pub use session::{Session, SessionError};
pub use subscriber::{MessageHandler, Subscriber};

use mqttbytes::v4::{Packet, Subscribe, Unsubscribe};
use mqttbytes::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type SubscriberMap = HashMap<String, Vec<Subscriber>>;

/// Outcome of handling a SUBSCRIBE packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    /// Subscriptions registered and SUBACK written.
    Registered,
    /// The session was removed and closed (unacceptable packet).
    Evicted,
    /// SUBACK could not be written; all just-added subscriptions were rolled
    /// back.
    WriteFailed,
}

/// Manages pub/sub.
///
/// The registry maps subscription patterns to subscriber lists ordered by
/// registration time. `publish` snapshots the matching subscribers under the
/// read lock and delivers outside of it; `Arc` ownership keeps a concurrently
/// removed subscriber valid until its delivery finishes, and a subscriber
/// registered after the snapshot does not receive the message.
pub struct Broker {
    subscribers: RwLock<SubscriberMap>,
    slash_prefix: bool,
}

impl Broker {
    /// If `slash_prefix` is true, subscribe and publish add a leading slash
    /// to topics that don't have one.
    pub fn new(slash_prefix: bool) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            slash_prefix,
        }
    }

    /// Drive the session event loop for a control client.
    pub async fn handle_connection(&self, session: Arc<Session>) {
        if let Err(e) = session.handshake().await {
            if !e.is_disconnect() {
                tracing::warn!(peer = %session.peer(), error = %e, "handshake failed");
            }
            session.close().await;
            return;
        }

        let subscriber = Subscriber::session(session.clone());
        loop {
            let packet = match session.read().await {
                Ok(p) => p,
                Err(e) => {
                    if !e.is_disconnect() {
                        tracing::warn!(peer = %session.peer(), error = %e, "session read failed");
                        session.close().await;
                    }
                    self.remove(&subscriber).await;
                    return;
                }
            };

            match packet {
                Packet::PingReq => {
                    if let Err(e) = session.send_pingresp().await {
                        tracing::warn!(peer = %session.peer(), error = %e, "failed to write PINGRESP");
                    }
                }
                Packet::Publish(p) => {
                    if is_internal_topic(&p.topic) {
                        continue;
                    }
                    self.publish(&p.topic, Message::Bytes(p.payload)).await;
                }
                Packet::Subscribe(s) => {
                    if self.handle_subscribe_packet(s, &session, true).await
                        == SubscribeStatus::Evicted
                    {
                        return;
                    }
                }
                Packet::Unsubscribe(u) => {
                    self.unsubscribe_all(&u, &subscriber).await;
                    if let Err(e) = session.send_unsuback(u.pkid).await {
                        tracing::warn!(peer = %session.peer(), error = %e, "failed to write UNSUBACK");
                    }
                }
                other => {
                    tracing::debug!(
                        peer = %session.peer(),
                        packet = session::packet_name(&other),
                        "unsupported packet, closing session"
                    );
                    self.remove(&subscriber).await;
                    session.close().await;
                    return;
                }
            }
        }
    }

    /// Register a subscriber on a pattern. Re-registering the same consumer
    /// is a no-op; empty patterns are ignored.
    pub async fn subscribe(&self, pattern: &str, subscriber: Subscriber) {
        if pattern.is_empty() {
            return;
        }
        let pattern = topic::normalize(pattern, self.slash_prefix).into_owned();
        let mut registry = self.subscribers.write().await;
        add_subscriber(&mut registry, pattern, subscriber);
    }

    /// Apply [`Broker::subscribe`] to every topic in a SUBSCRIBE packet.
    pub async fn subscribe_all(&self, packet: &Subscribe, subscriber: Subscriber) {
        for filter in &packet.filters {
            self.subscribe(&filter.path, subscriber.clone()).await;
        }
    }

    /// Atomically register all topics of a SUBSCRIBE packet and acknowledge
    /// it. The registry lock is held across add-and-SUBACK so the ack is
    /// never observable before the subscriptions are live; a failed SUBACK
    /// write rolls back every subscription added here.
    ///
    /// On success (and if `send_subscribe_event` is set) a
    /// [`SubscribeEvent`] is published on `$SYS/subscribe` after the lock is
    /// released, so handlers can react to new subscriptions.
    pub async fn handle_subscribe_packet(
        &self,
        packet: Subscribe,
        session: &Arc<Session>,
        send_subscribe_event: bool,
    ) -> SubscribeStatus {
        let subscriber = Subscriber::session(session.clone());

        // QoS above 0 is unsupported: drop the connection per the MQTT 3.1.1
        // rule for unacceptable packets.
        if packet.filters.iter().any(|f| f.qos != QoS::AtMostOnce) {
            self.remove(&subscriber).await;
            session.close().await;
            return SubscribeStatus::Evicted;
        }

        let mut topics = Vec::with_capacity(packet.filters.len());
        let mut added = Vec::new();
        let mut registry = self.subscribers.write().await;
        for filter in &packet.filters {
            if filter.path.is_empty() {
                continue;
            }
            let pattern = topic::normalize(&filter.path, self.slash_prefix).into_owned();
            if add_subscriber(&mut registry, pattern.clone(), subscriber.clone()) {
                added.push(pattern.clone());
            }
            topics.push(pattern);
        }

        if let Err(e) = session.send_suback(packet.pkid, packet.filters.len()).await {
            for pattern in &added {
                remove_from_pattern(&mut registry, pattern, &subscriber);
            }
            drop(registry);
            tracing::warn!(
                peer = %session.peer(),
                error = %e,
                "failed to write SUBACK, rolled back subscriptions"
            );
            return SubscribeStatus::WriteFailed;
        }
        drop(registry);

        if send_subscribe_event && !topics.is_empty() {
            let event = SubscribeEvent { topics };
            self.publish(SUBSCRIBE_EVENT_TOPIC, Message::Subscribe(Arc::new(event)))
                .await;
        }
        SubscribeStatus::Registered
    }

    /// Remove a subscriber from one pattern. Unknown patterns or
    /// non-registered subscribers are a silent no-op.
    pub async fn unsubscribe(&self, pattern: &str, subscriber: &Subscriber) {
        if pattern.is_empty() {
            return;
        }
        let pattern = topic::normalize(pattern, self.slash_prefix);
        let mut registry = self.subscribers.write().await;
        remove_from_pattern(&mut registry, &pattern, subscriber);
    }

    /// Apply [`Broker::unsubscribe`] to every topic in an UNSUBSCRIBE packet.
    pub async fn unsubscribe_all(&self, packet: &Unsubscribe, subscriber: &Subscriber) {
        for topic in &packet.topics {
            self.unsubscribe(topic, subscriber).await;
        }
    }

    /// Deliver a message to every subscriber whose pattern matches the
    /// topic. Empty topics are a no-op; delivery errors are logged and do
    /// not abort delivery to the remaining subscribers.
    pub async fn publish(&self, topic: &str, message: Message) {
        if topic.is_empty() {
            return;
        }
        let topic = topic::normalize(topic, self.slash_prefix);

        let targets: Vec<Subscriber> = {
            let registry = self.subscribers.read().await;
            let mut targets = Vec::new();
            for (pattern, subs) in registry.iter() {
                if topic::matches(pattern, &topic) {
                    targets.extend(subs.iter().cloned());
                }
            }
            targets
        };

        for sub in &targets {
            if let Err(e) = sub.deliver(&topic, &message).await {
                tracing::warn!(topic = %topic, error = %e, "subscriber failed to handle message");
            }
        }
    }

    /// Remove a subscriber from every pattern in one pass.
    pub async fn remove(&self, subscriber: &Subscriber) {
        let mut registry = self.subscribers.write().await;
        registry.retain(|_, subs| {
            subs.retain(|s| s != subscriber);
            !subs.is_empty()
        });
    }
}

fn add_subscriber(registry: &mut SubscriberMap, pattern: String, subscriber: Subscriber) -> bool {
    let subs = registry.entry(pattern).or_default();
    if subs.contains(&subscriber) {
        return false;
    }
    subs.push(subscriber);
    true
}

fn remove_from_pattern(registry: &mut SubscriberMap, pattern: &str, subscriber: &Subscriber) {
    if let Some(subs) = registry.get_mut(pattern) {
        subs.retain(|s| s != subscriber);
        if subs.is_empty() {
            registry.remove(pattern);
        }
    }
}

fn is_internal_topic(topic: &str) -> bool {
    topic
        .strip_prefix('/')
        .unwrap_or(topic)
        .starts_with("$SYS/")
}
