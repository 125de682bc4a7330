//! DHCP lease tables from `odhcpd` messages.
//!
//! Current firmware sends JSON (`{iface: [{m, ip, l, n}]}`); older firmware
//! sends a TSV with interface-name header lines. Leases are republished with
//! the readable key names `{mac, ip, host_name, ttl}`.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DhcpLease {
    #[serde(rename = "m")]
    pub mac: String,
    pub ip: String,
    #[serde(rename = "n")]
    pub hostname: String,
    #[serde(rename = "l")]
    pub ttl: String,
}

pub type DhcpState = HashMap<String, Vec<DhcpLease>>;

/// Parse an odhcpd message, falling back to the legacy TSV format when the
/// payload is not JSON.
pub fn parse_dhcp(text: &[u8]) -> DhcpState {
    match serde_json::from_slice(text) {
        Ok(state) => state,
        Err(_) => parse_legacy_dhcp(&String::from_utf8_lossy(text)),
    }
}

fn parse_legacy_dhcp(text: &str) -> DhcpState {
    let mut res = DhcpState::new();
    let mut iface = String::new();

    for line in text.lines() {
        let parts: Vec<&str> = line.split('\t').collect();

        if parts.len() == 1 && !parts[0].is_empty() {
            iface = parts[0].to_string();
            res.insert(iface.clone(), Vec::new());
        } else if parts.len() == 4 {
            let lease = DhcpLease {
                mac: parts[0].to_string(),
                ip: parts[1].to_string(),
                hostname: parts[3].to_string(),
                ttl: parts[2].to_string(),
            };
            res.entry(iface.clone()).or_default().push(lease);
        } else {
            tracing::debug!(line, "ignoring invalid line in legacy dhcp message");
        }
    }

    res
}

/// Rendition published on `matriarch/<d>/dhcp/leases`.
pub fn dhcp_state_to_json(state: &DhcpState) -> Value {
    let mut out = serde_json::Map::new();
    for (iface, leases) in state {
        let leases: Vec<Value> = leases
            .iter()
            .map(|l| {
                json!({
                    "mac": l.mac,
                    "ip": l.ip,
                    "host_name": l.hostname,
                    "ttl": l.ttl,
                })
            })
            .collect();
        out.insert(iface.clone(), Value::Array(leases));
    }
    Value::Object(out)
}
