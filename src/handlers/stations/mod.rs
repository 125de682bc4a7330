//! Aggregates Wi-Fi, LAN, switch, bridge, DHCP, and "thing" telemetry into
//! a unified per-device snapshot published on `matriarch/<d>/stations`.

pub mod bridge;
pub mod common;
pub mod dhcp;
pub mod switch;
pub mod wifi_stations;
pub mod wifi_survey;

pub use common::OuiDb;
pub use wifi_stations::{WifiEventMessage, WifiPollMessage, WifiStation};
pub use wifi_survey::WifiSurvey;

use crate::broker::topic::parse_device_topic;
use crate::broker::{Broker, Message, MessageHandler, Subscriber};
use crate::handlers::{round, HandlerContext};
use crate::store::FormationStore;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const KEY: &str = "stations";
pub const CPU_PORTS_KEY: &str = "cpu_ports";

const LAN_STATION_TIMEOUT_SECS: i64 = 10 * 60;
const THING_TIMEOUT_SECS: i64 = 5 * 60;

/// A wired client that is neither a Wi-Fi station nor a discovered thing.
#[derive(Debug, Clone, Serialize)]
pub struct LanStation {
    pub vendor: String,
    pub mac: String,
    pub ip: String,
    pub port: String,
    pub mode: String,
    pub local: bool,
    pub age: f64,
    pub seen: i64,
    pub inactive_time: i64,
    #[serde(skip)]
    pub last_updated_at: DateTime<Utc>,
}

impl LanStation {
    fn new(mac: String, ip: String, vendor: String, now: DateTime<Utc>) -> Self {
        Self {
            vendor,
            mac,
            ip,
            port: String::new(),
            mode: "other".to_string(),
            local: false,
            age: 0.0,
            seen: 0,
            inactive_time: 0,
            last_updated_at: now,
        }
    }
}

/// A discovered device attached to a pylon's LAN.
#[derive(Debug, Clone, Serialize)]
pub struct Thing {
    pub vendor: String,
    pub mac: String,
    pub ip: String,
    pub port: String,
    pub mode: String,
    pub local: bool,
    pub age: f64,
    pub seen: i64,
    pub inactive_time: i64,
    #[serde(skip)]
    pub last_updated_at: DateTime<Utc>,
    pub thing: Value,
}

impl Thing {
    fn new(ip: String, thing: Value, now: DateTime<Utc>) -> Self {
        Self {
            vendor: String::new(),
            mac: String::new(),
            ip,
            port: String::new(),
            mode: "thing".to_string(),
            local: false,
            age: 0.0,
            seen: 0,
            inactive_time: 0,
            last_updated_at: now,
            thing,
        }
    }
}

/// Everything the handler needs to compile snapshots, kept per formation.
#[derive(Debug, Clone, Default)]
pub struct StationsState {
    /// MAC -> station attributes
    pub wifi_stations: HashMap<String, WifiStation>,
    /// MAC -> LAN station
    pub lan_stations: HashMap<String, LanStation>,
    /// IP -> thing
    pub things: HashMap<String, Thing>,
}

/// The snapshot published for UI clients.
#[derive(Debug, Serialize)]
pub struct StationsMessage {
    pub public: Vec<WifiStation>,
    pub private: Vec<WifiStation>,
    pub other: Vec<LanStation>,
    pub thing: Vec<Thing>,
}

#[derive(Debug, Default, Deserialize)]
struct NetMessage {
    #[serde(default)]
    mac: Vec<MacEntry>,
    #[serde(default)]
    bridge: BridgeSection,
    #[serde(default, rename = "switch")]
    switch_dump: String,
}

#[derive(Debug, Deserialize)]
struct MacEntry {
    mac: String,
    ip: String,
}

#[derive(Debug, Default, Deserialize)]
struct BridgeSection {
    #[serde(default)]
    macs: BridgeMacs,
}

#[derive(Debug, Default, Deserialize)]
struct BridgeMacs {
    #[serde(default)]
    public: String,
    #[serde(default)]
    private: String,
}

#[derive(Debug, Deserialize)]
struct SysMessage {
    #[serde(default)]
    board: Board,
}

#[derive(Debug, Default, Deserialize)]
struct Board {
    #[serde(default)]
    switch: BoardSwitch,
}

#[derive(Debug, Default, Deserialize)]
struct BoardSwitch {
    #[serde(default)]
    switch0: Switch0,
}

#[derive(Debug, Default, Deserialize)]
struct Switch0 {
    #[serde(default)]
    ports: Vec<BoardPort>,
}

#[derive(Debug, Deserialize)]
struct BoardPort {
    num: i64,
    #[serde(default)]
    device: Option<String>,
}

pub struct StationsHandler {
    broker: Arc<Broker>,
    store: Arc<FormationStore>,
    oui: Arc<OuiDb>,
}

pub async fn register(ctx: &HandlerContext) -> Arc<StationsHandler> {
    let handler = Arc::new(StationsHandler {
        broker: ctx.broker.clone(),
        store: ctx.store.clone(),
        oui: ctx.oui.clone(),
    });

    let sub = Subscriber::handler(handler.clone());
    ctx.broker.subscribe("pylon/+/wifi/poll", sub.clone()).await;
    ctx.broker.subscribe("pylon/+/wifi/event", sub.clone()).await;
    ctx.broker
        .subscribe("pylon/+/things/discovery", sub.clone())
        .await;
    ctx.broker.subscribe("pylon/+/net", sub.clone()).await;
    ctx.broker.subscribe("pylon/+/sys/facts", sub.clone()).await;
    ctx.broker.subscribe("pylon/+/odhcpd", sub).await;
    handler
}

#[async_trait]
impl MessageHandler for StationsHandler {
    async fn handle_message(&self, topic: &str, message: Message) -> Result<()> {
        let parsed = parse_device_topic(topic)
            .ok_or_else(|| anyhow!("[stations] unparseable topic {}", topic))?;
        let payload = message
            .as_bytes()
            .ok_or_else(|| anyhow!("[stations] expected byte buffer on {}", topic))?
            .clone();
        let device_name = parsed.device_name.to_string();

        match parsed.path {
            "wifi/poll" => self.on_wifi_poll(&device_name, &payload).await,
            "wifi/event" => self.on_wifi_event(&device_name, &payload).await,
            "things/discovery" => self.on_things(&device_name, &payload).await,
            "net" => self.on_net(&device_name, &payload).await,
            "sys/facts" => self.on_sys_facts(&device_name, &payload).await,
            "odhcpd" => self.on_dhcp(&device_name, &payload).await,
            _ => Ok(()),
        }
    }
}

impl StationsHandler {
    async fn on_wifi_poll(&self, device_name: &str, payload: &[u8]) -> Result<()> {
        let msg: WifiPollMessage = serde_json::from_slice(payload)?;
        let survey = wifi_survey::compile_survey_message(&msg);

        let state = {
            let mut guard = self.store.write();
            let formation_id = guard.formation_id(device_name).unwrap_or_default();
            let mut state = current_state(&guard, &formation_id);

            for (iface_name, iface) in &msg.interfaces {
                let stations =
                    wifi_stations::parse_wifi_stations(&iface.stations, iface_name, &self.oui);
                state.wifi_stations = wifi_stations::merge(
                    std::mem::take(&mut state.wifi_stations),
                    stations,
                );
            }

            guard.put_state(&formation_id, KEY, state.clone());
            state
        };

        self.broker
            .publish(
                &format!("matriarch/{device_name}/wifi/survey"),
                Message::Json(serde_json::to_value(&survey)?),
            )
            .await;

        self.publish_snapshot(device_name, state).await
    }

    async fn on_wifi_event(&self, device_name: &str, payload: &[u8]) -> Result<()> {
        let msg: WifiEventMessage = serde_json::from_slice(payload)?;

        let state = {
            let mut guard = self.store.write();
            let formation_id = guard.formation_id(device_name).unwrap_or_default();
            let mut state = current_state(&guard, &formation_id);

            if msg.action == "assoc" {
                let mut station = WifiStation::new();
                station.insert("mac".to_string(), json!(msg.mac));
                state.wifi_stations.insert(msg.mac.clone(), station);
            } else if msg.action == "disassoc" {
                state.wifi_stations.remove(&msg.mac);
            }

            guard.put_state(&formation_id, KEY, state.clone());
            state
        };

        self.publish_snapshot(device_name, state).await
    }

    async fn on_things(&self, device_name: &str, payload: &[u8]) -> Result<()> {
        let msg: Value = serde_json::from_slice(payload)?;
        let (Some(ip), Some(thing)) = (
            msg.get("address").and_then(Value::as_str),
            msg.get("thing").filter(|t| t.is_object()),
        ) else {
            bail!("[stations] got invalid things discovery message: {}", msg);
        };

        let now = Utc::now();
        let state = {
            let mut guard = self.store.write();
            let formation_id = guard.formation_id(device_name).unwrap_or_default();
            let mut state = current_state(&guard, &formation_id);

            match state.things.get_mut(ip) {
                Some(existing) => {
                    existing.thing = thing.clone();
                    existing.last_updated_at = now;
                }
                None => {
                    state
                        .things
                        .insert(ip.to_string(), Thing::new(ip.to_string(), thing.clone(), now));
                }
            }

            guard.put_state(&formation_id, KEY, state.clone());
            state
        };

        self.publish_snapshot(device_name, state).await
    }

    async fn on_net(&self, device_name: &str, payload: &[u8]) -> Result<()> {
        let msg: NetMessage = serde_json::from_slice(payload)?;
        let now = Utc::now();

        let state = {
            let mut guard = self.store.write();
            let formation_id = guard.formation_id(device_name).unwrap_or_default();
            let mut state = current_state(&guard, &formation_id);

            for entry in &msg.mac {
                if let Some(thing) = state.things.get_mut(&entry.ip) {
                    thing.mac = entry.mac.clone();
                    thing.vendor = self.oui.vendor(&entry.mac);
                    thing.last_updated_at = now;
                } else if let Some(station) = state.wifi_stations.get_mut(&entry.mac) {
                    station.insert("ip".to_string(), json!(entry.ip));
                } else {
                    state.lan_stations.insert(
                        entry.mac.clone(),
                        LanStation::new(
                            entry.mac.clone(),
                            entry.ip.clone(),
                            self.oui.vendor(&entry.mac),
                            now,
                        ),
                    );
                }
            }

            let cpu_ports = guard
                .get_device_state::<Vec<String>>(device_name, CPU_PORTS_KEY)
                .map(|p| (*p).clone())
                .unwrap_or_default();
            assign_ports(&msg.switch_dump, &cpu_ports, &mut state, now);

            if let Err(e) = assign_bridge_info(&msg.bridge, &mut state, now) {
                tracing::warn!(
                    device = device_name,
                    error = %e,
                    "failed to assign bridge info"
                );
            }

            remove_timed_out_stations(&mut state, now);
            guard.put_state(&formation_id, KEY, state.clone());
            state
        };

        self.publish_snapshot(device_name, state).await
    }

    async fn on_sys_facts(&self, device_name: &str, payload: &[u8]) -> Result<()> {
        let msg: SysMessage = serde_json::from_slice(payload)?;

        let cpu_ports: Vec<String> = msg
            .board
            .switch
            .switch0
            .ports
            .iter()
            .filter(|p| p.device.is_some())
            .map(|p| p.num.to_string())
            .collect();

        let formation_id = self.store.formation_id(device_name).unwrap_or_default();
        self.store
            .put_device_state(&formation_id, device_name, CPU_PORTS_KEY, cpu_ports);
        Ok(())
    }

    async fn on_dhcp(&self, device_name: &str, payload: &[u8]) -> Result<()> {
        let state = dhcp::parse_dhcp(payload);
        self.broker
            .publish(
                &format!("matriarch/{device_name}/dhcp/leases"),
                Message::Json(dhcp::dhcp_state_to_json(&state)),
            )
            .await;
        Ok(())
    }

    async fn publish_snapshot(&self, device_name: &str, state: StationsState) -> Result<()> {
        let msg = build_snapshot(state, Utc::now().timestamp());
        self.broker
            .publish(
                &format!("matriarch/{device_name}/stations"),
                Message::Json(serde_json::to_value(&msg)?),
            )
            .await;
        Ok(())
    }
}

fn current_state(guard: &crate::store::StoreWriteGuard<'_>, formation_id: &str) -> StationsState {
    guard
        .get_state::<StationsState>(formation_id, KEY)
        .map(|s| (*s).clone())
        .unwrap_or_default()
}

/// Map MACs to switch ports (CPU ports excluded) and annotate all three
/// collections.
fn assign_ports(
    switch_dump: &str,
    cpu_ports: &[String],
    state: &mut StationsState,
    now: DateTime<Utc>,
) {
    let (_, mac_to_port) = switch::parse_switch(switch_dump, cpu_ports);

    for (mac, station) in &mut state.wifi_stations {
        if let Some(port) = mac_to_port.get(mac) {
            station.insert("port".to_string(), json!(port));
        }
    }

    for (mac, station) in &mut state.lan_stations {
        if let Some(port) = mac_to_port.get(mac) {
            station.port = port.clone();
            station.last_updated_at = now;
        }
    }

    for thing in state.things.values_mut() {
        if thing.mac.is_empty() {
            continue;
        }
        if let Some(port) = mac_to_port.get(&thing.mac) {
            thing.port = port.clone();
            thing.last_updated_at = now;
        }
    }
}

/// Fold the public and private bridge tables into age/local annotations.
fn assign_bridge_info(
    section: &BridgeSection,
    state: &mut StationsState,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut bridge_info = bridge::parse_bridge_macs(&section.macs.private)?;
    for (mac, info) in bridge::parse_bridge_macs(&section.macs.public)? {
        bridge_info.insert(mac, info);
    }

    for (mac, station) in &mut state.wifi_stations {
        if let Some(info) = bridge_info.get(mac) {
            station.insert("age".to_string(), json!(info.age));
            station.insert("local".to_string(), json!(info.local));
        }
    }

    for (mac, station) in &mut state.lan_stations {
        if let Some(info) = bridge_info.get(mac) {
            station.age = info.age;
            station.local = info.local;
            station.last_updated_at = now;
        }
    }

    for thing in state.things.values_mut() {
        if thing.mac.is_empty() {
            continue;
        }
        if let Some(info) = bridge_info.get(&thing.mac) {
            thing.age = info.age;
            thing.local = info.local;
            thing.last_updated_at = now;
        }
    }

    Ok(())
}

/// LAN stations idle for over ten minutes and things idle for over five are
/// dropped.
fn remove_timed_out_stations(state: &mut StationsState, now: DateTime<Utc>) {
    state.lan_stations.retain(|_, station| {
        station.inactive_time = (now - station.last_updated_at).num_seconds();
        station.inactive_time <= LAN_STATION_TIMEOUT_SECS
    });

    state.things.retain(|_, thing| {
        thing.inactive_time = (now - thing.last_updated_at).num_seconds();
        thing.inactive_time <= THING_TIMEOUT_SECS
    });
}

/// Partition the state into the published snapshot, stamping each entry with
/// `seen = now - age`.
fn build_snapshot(state: StationsState, now: i64) -> StationsMessage {
    let mut msg = StationsMessage {
        public: Vec::new(),
        private: Vec::new(),
        other: Vec::with_capacity(state.lan_stations.len()),
        thing: Vec::new(),
    };

    for (_, mut station) in state.wifi_stations {
        if let Some(age) = station.get("age").and_then(Value::as_f64) {
            station.insert("seen".to_string(), json!(now - round(age, 0) as i64));
        }

        if station.get("mode").and_then(Value::as_str) == Some("public") {
            msg.public.push(station);
        } else {
            msg.private.push(station);
        }
    }

    for (_, mut thing) in state.things {
        if !thing.mac.is_empty() {
            thing.seen = now - round(thing.age, 0) as i64;
            msg.thing.push(thing);
        }
    }

    for (_, mut station) in state.lan_stations {
        station.seen = now - round(station.age, 0) as i64;
        msg.other.push(station);
    }

    msg
}
