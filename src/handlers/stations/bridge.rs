//! Parsing of `brctl showmacs` output carried in `net` messages.

use anyhow::Result;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BridgeInfo {
    pub local: bool,
    pub age: f64,
}

/// Parse the table at `msg["bridge"]["macs"]["public"]` (resp. `private`).
/// Keys in the returned map are MAC addresses. Rows without the expected
/// five tab-separated columns end the table.
pub fn parse_bridge_macs(text: &str) -> Result<HashMap<String, BridgeInfo>> {
    let mut res = HashMap::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() != 5 {
            return Ok(res);
        }

        if parts[0].starts_with("port no") {
            continue;
        }

        let age: f64 = parts[4].trim().parse()?;
        res.insert(
            parts[1].trim().to_string(),
            BridgeInfo {
                local: parts[2].trim() == "yes",
                age,
            },
        );
    }

    Ok(res)
}
