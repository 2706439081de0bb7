use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::time::{add_seconds, parse_instant_or_now};

/// Arbitrary JSON payload carried by an event.
pub type EventData = serde_json::Map<String, serde_json::Value>;

/// A timestamped activity record inside a bucket.
///
/// An event covers `[timestamp, timestamp + duration)`. Heartbeat merging
/// grows `duration` in place; nothing else mutates a stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub data: EventData,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, duration: f64, data: EventData) -> Self {
        Self {
            id: None,
            timestamp,
            duration,
            data,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        add_seconds(self.timestamp, self.duration)
    }
}

/// Event as submitted by clients.
///
/// The timestamp is kept as raw JSON so a malformed or missing value can fall
/// back to "now" instead of rejecting the whole request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventInput {
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub data: EventData,
}

impl EventInput {
    pub fn into_event(self) -> Event {
        let timestamp = parse_instant_or_now(self.timestamp.as_ref().and_then(|v| v.as_str()));
        let duration = self.duration.filter(|d| d.is_finite() && *d >= 0.0).unwrap_or(0.0);
        Event::new(timestamp, duration, self.data)
    }
}

/// A named collection of events from one watcher on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub bucket_type: String,
    pub client: String,
    pub hostname: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub data: EventData,
}

/// Optional metadata supplied when creating or updating a bucket.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub bucket_type: Option<String>,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub data: Option<EventData>,
}

impl BucketConfig {
    /// Metadata used when a bucket is created implicitly by a write.
    pub fn implicit(kind: &str) -> Self {
        Self {
            bucket_type: Some(kind.to_string()),
            client: Some(kind.to_string()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, bucket_type: impl Into<String>) -> Self {
        self.bucket_type = Some(bucket_type.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

impl Bucket {
    pub fn create(id: &str, config: BucketConfig, default_hostname: &str) -> Self {
        Self {
            id: id.to_string(),
            name: config.name.unwrap_or_else(|| id.to_string()),
            bucket_type: config.bucket_type.unwrap_or_else(|| "unknown".to_string()),
            client: config.client.unwrap_or_else(|| "unknown".to_string()),
            hostname: config
                .hostname
                .unwrap_or_else(|| default_hostname.to_string()),
            created: Utc::now(),
            data: config.data.unwrap_or_default(),
        }
    }

    /// Apply metadata from a repeated create call.
    ///
    /// Placeholder values ("unknown", empty strings, empty data) never
    /// overwrite what is already stored.
    pub fn apply(&mut self, config: BucketConfig) {
        if let Some(t) = config.bucket_type.filter(|t| !t.is_empty() && t != "unknown") {
            self.bucket_type = t;
        }
        if let Some(c) = config.client.filter(|c| !c.is_empty() && c != "unknown") {
            self.client = c;
        }
        if let Some(h) = config.hostname.filter(|h| !h.is_empty()) {
            self.hostname = h;
        }
        if let Some(d) = config.data.filter(|d| !d.is_empty()) {
            self.data = d;
        }
    }
}
