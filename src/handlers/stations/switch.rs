//! Parsing of swconfig-style switch dumps from `net` messages.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Port {
    pub link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub speed: String,
    #[serde(skip_serializing_if = "is_false")]
    pub gateway: bool,
}

/// Key is the port number as a string.
pub type SwitchState = HashMap<String, Port>;

static PORT_TO_MAC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Port\s+(\d+):\s+MAC\s+(([a-fA-F\d][a-fA-F\d]:?){6})").expect("port/mac regex")
});

/// Parse a switch dump. The second return value maps MAC address to port
/// number; ports listed in `exclude_ports` (the CPU ports) are dropped from
/// both maps.
pub fn parse_switch(text: &str, exclude_ports: &[String]) -> (SwitchState, HashMap<String, String>) {
    let mut ports = SwitchState::new();
    let mut macs = HashMap::new();

    for line in text.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("link: ") {
            if let Some((num, port)) = parse_port(rest) {
                if !exclude_ports.contains(&num) {
                    ports.insert(num, port);
                }
            }
        } else if line.starts_with("Port ") {
            if let Some((num, mac)) = parse_mac(line) {
                if !exclude_ports.contains(&num) {
                    macs.insert(mac, num);
                }
            }
        }
    }

    (ports, macs)
}

/// A line like `port:0 link:up speed:1000baseT full-duplex` (already
/// stripped of its `link: ` prefix).
fn parse_port(rest: &str) -> Option<(String, Port)> {
    let mut parts = rest.splitn(3, ' ');
    let num = parts.next()?.strip_prefix("port:")?.to_string();
    let link = parts.next()?.strip_prefix("link:")?.to_string();
    let speed = parts
        .next()
        .and_then(|s| s.strip_prefix("speed:"))
        .unwrap_or("")
        .to_string();
    Some((num, Port { link, speed, gateway: false }))
}

fn parse_mac(line: &str) -> Option<(String, String)> {
    let caps = PORT_TO_MAC_REGEX.captures(line)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}
