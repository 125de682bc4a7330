//! Shared text-dump parsing helpers and the OUI vendor database.

use std::collections::HashMap;
use std::path::Path;

/// Group the lines of a free-text dump into chunks, starting a new chunk at
/// every line with the given prefix. Blank lines are skipped.
pub fn chunk_lines_by_prefix(text: &str, prefix: &str, include_first_line: bool) -> Vec<Vec<String>> {
    let mut res = Vec::new();
    let mut current: Option<Vec<String>> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with(prefix) {
            if let Some(chunk) = current.take() {
                if !chunk.is_empty() {
                    res.push(chunk);
                }
            }
            current = Some(if include_first_line {
                vec![line.to_string()]
            } else {
                Vec::new()
            });
        } else if let Some(chunk) = current.as_mut() {
            chunk.push(line.to_string());
        }
    }

    if let Some(chunk) = current {
        if !chunk.is_empty() {
            res.push(chunk);
        }
    }

    res
}

/// Split a `key: value` line, trimming both sides. Lines without a colon
/// yield empty strings.
pub fn split_line(line: &str) -> (String, String) {
    match line.split_once(':') {
        Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
        None => (String::new(), String::new()),
    }
}

/// Extract mode and radio from an interface name like `wlan-private-a`.
pub fn parse_interface_name(iface: &str) -> (Option<String>, Option<String>) {
    let mut parts = iface.split('-');
    let _ = parts.next();
    let mode = parts.next().map(ToString::to_string);
    let radio = parts.next().map(ToString::to_string);
    (mode, radio)
}

/// MAC-prefix to vendor lookup table.
///
/// File format: one `AA:BB:CC Vendor Name` entry per line, `#` comments.
#[derive(Debug, Default)]
pub struct OuiDb {
    prefixes: HashMap<String, String>,
}

impl OuiDb {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the database, degrading to empty lookups when the file is
    /// missing or unreadable.
    pub fn load_or_empty(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "OUI database unavailable, vendor lookups disabled");
                Self::empty()
            }
        }
    }

    pub fn parse(text: &str) -> Self {
        let mut prefixes = HashMap::new();
        for line in text.lines() {
            if line.starts_with('#') {
                continue;
            }
            if let Some((prefix, vendor)) = line.split_once(' ') {
                prefixes.insert(prefix.trim().to_string(), vendor.trim().to_string());
            }
        }
        Self { prefixes }
    }

    /// Vendor for a MAC address, looked up by its first three octets.
    /// Unknown prefixes resolve to an empty string.
    pub fn vendor(&self, mac: &str) -> String {
        mac.get(..8)
            .and_then(|prefix| self.prefixes.get(prefix))
            .cloned()
            .unwrap_or_default()
    }
}
