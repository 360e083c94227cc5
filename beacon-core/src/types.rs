//! Domain types shared between the client, the queue and the server wire format

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Arbitrary key/value payload carried by an event
pub type EventData = serde_json::Map<String, serde_json::Value>;

/// A time-stamped activity event.
///
/// Matches the server's wire shape: `duration` is float seconds and `id` is
/// only present on events that came back from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Start of the event
    pub timestamp: DateTime<Utc>,

    /// Length of the event in seconds
    #[serde(default)]
    pub duration: f64,

    #[serde(default)]
    pub data: EventData,
}

impl Event {
    /// Create a zero-duration event
    pub fn new(timestamp: DateTime<Utc>, data: EventData) -> Self {
        Self {
            id: None,
            timestamp,
            duration: 0.0,
            data,
        }
    }

    /// Builder-style duration setter
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = seconds;
        self
    }

    /// End of the event, `None` if it lies outside the representable range
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .checked_add_signed(seconds_to_duration(self.duration))
    }

    /// Encode as the JSON object posted to the server
    pub fn to_json(&self) -> serde_json::Value {
        // Event only holds JSON-safe fields, so this cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode from a server or queue payload
    pub fn from_json(value: &serde_json::Value) -> crate::error::Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Bucket metadata as listed by `GET buckets/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

/// Decides whether `heartbeat` extends `last`.
///
/// Arguments are the accumulated event, the incoming heartbeat and the
/// heartbeat's pulse tolerance in seconds. Returns the merged event, or
/// `None` when the two must stay separate.
pub type MergeFn = Arc<dyn Fn(&Event, &Event, f64) -> Option<Event> + Send + Sync>;

/// The server's heartbeat merge rule.
///
/// Two events merge when their data are identical and the heartbeat starts
/// no earlier than `last` and no later than `last.end() + pulsetime`. The
/// merged event keeps `last`'s start and id and stretches to cover both.
pub fn heartbeat_merge(last: &Event, heartbeat: &Event, pulsetime: f64) -> Option<Event> {
    if last.data != heartbeat.data {
        return None;
    }

    // An unrepresentable window end never merges.
    let window_end = last
        .end()?
        .checked_add_signed(seconds_to_duration(pulsetime))?;
    if heartbeat.timestamp < last.timestamp || heartbeat.timestamp > window_end {
        return None;
    }

    let offset = duration_to_seconds(heartbeat.timestamp - last.timestamp);
    let mut merged = last.clone();
    merged.duration = last.duration.max(offset + heartbeat.duration);
    Some(merged)
}

/// The default merge predicate wrapped for injection
pub fn default_merge() -> MergeFn {
    Arc::new(heartbeat_merge)
}

fn seconds_to_duration(seconds: f64) -> ChronoDuration {
    ChronoDuration::microseconds((seconds * 1_000_000.0).round() as i64)
}

fn duration_to_seconds(duration: ChronoDuration) -> f64 {
    match duration.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => duration.num_milliseconds() as f64 / 1_000.0,
    }
}
