use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discrete health value a publisher may attach to an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Warning,
    Critical,
    Active,
    Idle,
    Started,
    Running,
    Restarted,
    ActiveReminder,
}

/// One hop stamp, `host:serviceType:serviceName`, appended by every
/// process that relays an envelope onward.
pub type RouteStamp = String;

/// The unit of transport on the bus.
///
/// `ChannelName` must be non-empty; callers crossing the HTTPS bridge
/// must additionally restrict it to `[A-Za-z0-9]+` (checked at that
/// boundary, not here, since the bus itself accepts any non-empty
/// name).
///
/// Wire format is `PascalCase` field names (`Uuid`, `ChannelName`, ...);
/// every field but `ChannelName` defaults on deserialize so a minimal
/// external payload like `{"ChannelName":"c","Text":"hello"}` parses,
/// with `enrich()` filling in the rest before publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    #[serde(default)]
    pub uuid: String,
    pub channel_name: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default = "unset_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metric_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub route: Vec<RouteStamp>,
}

fn unset_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Envelope {
    /// A bare envelope with the given channel; every other field is
    /// left at its zero value for `enrich` to fill in on publish.
    pub fn new(channel_name: impl Into<String>) -> Self {
        Envelope {
            uuid: String::new(),
            channel_name: channel_name.into(),
            service_type: String::new(),
            service_name: String::new(),
            hostname: String::new(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            status: None,
            text: String::new(),
            summary: String::new(),
            metric_name: String::new(),
            metric: None,
            data: None,
            route: Vec::new(),
        }
    }

    /// Fill in `uuid`/`hostname`/`timestamp` if they are still at
    /// their zero value. `last_published` enforces the per-process
    /// monotonic-timestamp invariant: `timestamp = max(now, last_published)`.
    pub fn enrich(&mut self, hostname: &str, now: DateTime<Utc>, last_published: DateTime<Utc>) {
        if self.uuid.is_empty() {
            self.uuid = Uuid::new_v4().to_string();
        }
        if self.hostname.is_empty() {
            self.hostname = short_hostname(hostname);
        }
        if self.timestamp == DateTime::<Utc>::UNIX_EPOCH {
            self.timestamp = now.max(last_published);
        }
    }

    pub fn route_stamp(host: &str, service_type: &str, service_name: &str) -> RouteStamp {
        format!("{host}:{service_type}:{service_name}")
    }

    pub fn contains_route_stamp(&self, stamp: &str) -> bool {
        self.route.iter().any(|s| s == stamp)
    }

    /// Append `stamp` unless it is already the last hop (the bus does
    /// not re-stamp a message that a relay already stamped before
    /// calling `Send`).
    pub fn append_route_stamp(&mut self, stamp: RouteStamp) {
        if self.route.last().map(String::as_str) != Some(stamp.as_str()) {
            self.route.push(stamp);
        }
    }

    /// `true` if any route entry begins with `host:` — used by bridges
    /// honoring a `route_loop_skip_host` hint.
    pub fn route_contains_host(&self, host: &str) -> bool {
        let prefix = format!("{host}:");
        self.route.iter().any(|s| s.starts_with(&prefix))
    }
}

pub fn short_hostname(full: &str) -> String {
    full.split('.').next().unwrap_or(full).to_string()
}

pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrich_fills_empty_fields_only() {
        let mut e = Envelope::new("events");
        e.hostname = "preset".to_string();
        let now = Utc::now();
        e.enrich("box.example.com", now, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(e.hostname, "preset");
        assert!(!e.uuid.is_empty());
        assert_eq!(e.timestamp, now);
    }

    #[test]
    fn enrich_uses_short_hostname() {
        let mut e = Envelope::new("events");
        e.enrich("box.example.com", Utc::now(), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(e.hostname, "box");
    }

    #[test]
    fn enrich_respects_monotonic_timestamp() {
        let mut e = Envelope::new("events");
        let last = Utc::now();
        let earlier = last - chrono::Duration::seconds(5);
        e.enrich("host", earlier, last);
        assert_eq!(e.timestamp, last);
    }

    #[test]
    fn route_stamp_not_duplicated_when_last_hop_matches() {
        let mut e = Envelope::new("events");
        let stamp = Envelope::route_stamp("h", "wsc", "main");
        e.append_route_stamp(stamp.clone());
        e.append_route_stamp(stamp.clone());
        assert_eq!(e.route, vec![stamp]);
    }

    #[test]
    fn channel_name_validation() {
        assert!(is_valid_channel_name("events1"));
        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name("ev-ents"));
    }
}
