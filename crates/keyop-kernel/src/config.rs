use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A subscription or publication parameter: which channel, and how far
/// back a subscriber is willing to read. `max_age_secs = 0` means no
/// age filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    #[serde(default)]
    pub max_age_secs: u64,
}

impl ChannelInfo {
    pub fn max_age(&self) -> Option<chrono::Duration> {
        if self.max_age_secs == 0 {
            None
        } else {
            Some(chrono::Duration::seconds(self.max_age_secs as i64))
        }
    }
}

/// One configured service instance: a name, a type (which
/// implementation to construct), its freeform config, and the roles it
/// publishes to / subscribes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub pubs: HashMap<String, ChannelInfo>,
    #[serde(default)]
    pub subs: HashMap<String, ChannelInfo>,
}
