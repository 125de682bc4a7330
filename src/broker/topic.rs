//! Topic matching and parsing.
//!
//! Subscriptions may contain wildcards: `+` matches exactly one path segment,
//! `#` matches zero or more trailing segments and is only valid as the last
//! segment. Concrete topics never contain wildcards.

use std::borrow::Cow;

const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

/// Check whether a subscription pattern matches a concrete topic.
///
/// A `#` anywhere but the final segment makes the subscription invalid; an
/// invalid subscription never matches.
pub fn matches(subscription: &str, topic: &str) -> bool {
    let sub: Vec<&str> = subscription.split('/').collect();
    let top: Vec<&str> = topic.split('/').collect();

    if sub[..sub.len() - 1]
        .iter()
        .any(|s| *s == MULTI_LEVEL_WILDCARD)
    {
        return false;
    }

    if sub[sub.len() - 1] == MULTI_LEVEL_WILDCARD {
        let prefix = &sub[..sub.len() - 1];
        return prefix
            .iter()
            .zip(top.iter())
            .all(|(s, t)| *s == SINGLE_LEVEL_WILDCARD || s == t);
    }

    sub.len() == top.len()
        && sub
            .iter()
            .zip(top.iter())
            .all(|(s, t)| *s == SINGLE_LEVEL_WILDCARD || s == t)
}

/// Prepend a slash unless the topic already starts with one.
pub fn normalize(topic: &str, slash_prefix: bool) -> Cow<'_, str> {
    if slash_prefix && !topic.starts_with('/') {
        Cow::Owned(format!("/{topic}"))
    } else {
        Cow::Borrowed(topic)
    }
}

/// A device-scoped topic of the form `<service>/<device>/<path...>`,
/// with an optional leading slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic<'a> {
    pub service: &'a str,
    pub device_name: &'a str,
    pub path: &'a str,
}

/// Split a topic into service prefix, device name, and remaining path.
pub fn parse_device_topic(topic: &str) -> Option<DeviceTopic<'_>> {
    let trimmed = topic.strip_prefix('/').unwrap_or(topic);
    let mut parts = trimmed.splitn(3, '/');
    let service = parts.next().filter(|s| !s.is_empty())?;
    let device_name = parts.next().filter(|s| !s.is_empty())?;
    let path = parts.next().unwrap_or("");
    Some(DeviceTopic {
        service,
        device_name,
        path,
    })
}
