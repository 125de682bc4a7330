//! Parsing of `iw dev $DEVICE station dump` output from `wifi/poll`
//! messages.

use crate::handlers::stations::common::{
    chunk_lines_by_prefix, parse_interface_name, split_line, OuiDb,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// One station as a key/value map. Most values are free-form strings the
/// cloud never interprets; the exception is `inactive time`, which is
/// normalized to an integer `inactive_time` in seconds.
pub type WifiStation = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WifiInterface {
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub stations: String,
    #[serde(default)]
    pub mpath: String,
    #[serde(default)]
    pub survey: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WifiPollMessage {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, rename = "dev")]
    pub interfaces: HashMap<String, WifiInterface>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WifiEventMessage {
    pub action: String,
    #[serde(rename = "station")]
    pub mac: String,
}

static MAC_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-fA-F\d][a-fA-F\d]:?){6}").expect("mac regex"));

static INACTIVE_TIME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s+(\S+)").expect("inactive time regex"));

/// Parse a station dump into per-MAC attribute maps. The interface name
/// contributes `mode` and `radio`.
pub fn parse_wifi_stations(
    text: &str,
    iface: &str,
    oui: &OuiDb,
) -> HashMap<String, WifiStation> {
    let (mode, radio) = parse_interface_name(iface);
    let mut stations = HashMap::new();

    for chunk in chunk_lines_by_prefix(text, "Station", true) {
        let mut current = WifiStation::new();
        let mut mac = String::new();

        for (i, line) in chunk.iter().enumerate() {
            if i == 0 {
                mac = MAC_REGEX
                    .find(line)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                current.insert("mac".to_string(), json!(mac));
                current.insert("vendor".to_string(), json!(oui.vendor(&mac)));

                if let Some(mode) = &mode {
                    current.insert("mode".to_string(), json!(mode));
                }
                if let Some(radio) = &radio {
                    current.insert("radio".to_string(), json!(radio));
                }
            } else {
                let (key, value) = split_line(line);
                current.insert(key, json!(value));
            }
        }

        let inactive = current
            .remove("inactive time")
            .and_then(|v| v.as_str().map(normalize_inactive_time))
            .unwrap_or(0);
        current.insert("inactive_time".to_string(), json!(inactive));

        stations.insert(mac, current);
    }

    stations
}

/// `370 ms` or `23 seconds` to whole seconds.
fn normalize_inactive_time(s: &str) -> i64 {
    let Some(caps) = INACTIVE_TIME_REGEX.captures(s) else {
        return 0;
    };
    let Ok(t) = caps[1].parse::<i64>() else {
        return 0;
    };
    if &caps[2] == "ms" {
        t / 1000
    } else {
        t
    }
}

/// Merge `b` into `a` and return it.
pub fn merge(
    mut a: HashMap<String, WifiStation>,
    b: HashMap<String, WifiStation>,
) -> HashMap<String, WifiStation> {
    a.extend(b);
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATIONS_DUMP: &str = "
Station 4C:7C:5F:FF:FF:FF (on wlan-private-a)
      inactive time:  370 ms
      rx bytes:       55456
      rx packets:     814
      tx bytes:       36043
      tx packets:     260
      tx retries:     0
      tx failed:      2
      signal:         -45 dBm
      signal avg:     -46 dBm
      tx bitrate:     6.0 MBit/s
      rx bitrate:     24.0 MBit/s
      authorized:     yes
      authenticated:  yes
      preamble:       long
      WMM/WME:        yes
      MFP:            no
      TDLS peer:      no
      connected time: 162 seconds
Station 4C:7C:5F:FE:FE:FE (on wlan-private-a)
      inactive time:  23 seconds
      rx bytes:       4711
      rx packets:     814
      tx bytes:       36043
      tx packets:     260
      tx retries:     0
      tx failed:      2
      signal:         -45 dBm
      signal avg:     -46 dBm
      tx bitrate:     6.0 MBit/s
      rx bitrate:     24.0 MBit/s
      authorized:     yes
      authenticated:  yes
      preamble:       long
      WMM/WME:        yes
      MFP:            no
      TDLS peer:      no
      connected time: 162 seconds
";

    #[test]
    fn each_station_has_22_attributes() {
        let stations = parse_wifi_stations(STATIONS_DUMP, "wlan-private-a", &OuiDb::empty());
        assert_eq!(stations.len(), 2);
        assert_eq!(stations["4C:7C:5F:FF:FF:FF"].len(), 22);
        assert_eq!(stations["4C:7C:5F:FE:FE:FE"].len(), 22);
    }

    #[test]
    fn station_data_includes_rx_bytes() {
        let stations = parse_wifi_stations(STATIONS_DUMP, "wlan-private-a", &OuiDb::empty());
        assert_eq!(stations["4C:7C:5F:FF:FF:FF"]["rx bytes"], "55456");
        assert_eq!(stations["4C:7C:5F:FE:FE:FE"]["rx bytes"], "4711");
    }

    #[test]
    fn inactive_time_is_normalized_to_seconds() {
        let stations = parse_wifi_stations(STATIONS_DUMP, "wlan-private-a", &OuiDb::empty());

        let s1 = &stations["4C:7C:5F:FF:FF:FF"];
        assert_eq!(s1["inactive_time"], 0);
        assert!(s1.get("inactive time").is_none());

        let s2 = &stations["4C:7C:5F:FE:FE:FE"];
        assert_eq!(s2["inactive_time"], 23);
        assert!(s2.get("inactive time").is_none());
    }

    #[test]
    fn mode_and_radio_come_from_the_interface_name() {
        let stations = parse_wifi_stations(STATIONS_DUMP, "wlan-private-a", &OuiDb::empty());
        let s = &stations["4C:7C:5F:FF:FF:FF"];
        assert_eq!(s["mode"], "private");
        assert_eq!(s["radio"], "a");
    }

    #[test]
    fn vendor_is_resolved_from_the_oui_db() {
        let oui = OuiDb::parse("4C:7C:5F Acme Devices\n");
        let stations = parse_wifi_stations(STATIONS_DUMP, "wlan-private-a", &oui);
        assert_eq!(stations["4C:7C:5F:FF:FF:FF"]["vendor"], "Acme Devices");
    }

    #[test]
    fn merge_prefers_the_newer_map() {
        let mut a = HashMap::new();
        let mut sa = WifiStation::new();
        sa.insert("mac".into(), serde_json::json!("aa"));
        a.insert("aa".to_string(), sa);

        let mut b = HashMap::new();
        let mut sb = WifiStation::new();
        sb.insert("mac".into(), serde_json::json!("aa"));
        sb.insert("signal".into(), serde_json::json!("-45 dBm"));
        b.insert("aa".to_string(), sb);

        let merged = merge(a, b);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["aa"]["signal"], "-45 dBm");
    }
}
