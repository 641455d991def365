use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::{ContextV7, Timestamp, Uuid};

/// Arbitrary event or person properties.
pub type Properties = serde_json::Map<String, Value>;

static UUID_CONTEXT: Lazy<Mutex<ContextV7>> = Lazy::new(|| Mutex::new(ContextV7::new()));

/// Generate a time-ordered (UUIDv7) identifier.
///
/// The shared context keeps ids generated within the same millisecond sortable
/// by creation order.
pub(crate) fn uuid_v7() -> String {
    let ctx = UUID_CONTEXT.lock().unwrap();
    Uuid::new_v7(Timestamp::now(&*ctx)).to_string()
}

/// A single captured event, as submitted to the ingestion endpoint.
///
/// Created at capture time and immutable after enqueue, except for truncation
/// of long string properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Time-ordered unique identifier (UUIDv7, 36-character string form).
    pub uuid: String,
    /// Event name, e.g. `$pageview`.
    pub event: String,
    /// Enriched event properties.
    pub properties: Properties,
    /// Person properties to set, only present on `$identify` events.
    #[serde(rename = "$set", skip_serializing_if = "Option::is_none")]
    pub set: Option<Properties>,
    /// Person properties to set once, only present on `$identify` events.
    #[serde(rename = "$set_once", skip_serializing_if = "Option::is_none")]
    pub set_once: Option<Properties>,
    /// Capture time. Replaced by a relative `offset` when the event travels
    /// through the batching queue.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub(crate) fn new(event: String, properties: Properties, timestamp: DateTime<Utc>) -> Self {
        Self {
            uuid: uuid_v7(),
            event,
            properties,
            set: None,
            set_once: None,
            timestamp,
        }
    }

    /// Truncate every string property value to `max_length` characters.
    ///
    /// Applies recursively to nested objects and arrays in `properties`,
    /// `$set` and `$set_once`.
    pub(crate) fn truncate_strings(&mut self, max_length: usize) {
        truncate_properties(&mut self.properties, max_length);
        if let Some(set) = self.set.as_mut() {
            truncate_properties(set, max_length);
        }
        if let Some(set_once) = self.set_once.as_mut() {
            truncate_properties(set_once, max_length);
        }
    }
}

fn truncate_properties(properties: &mut Properties, max_length: usize) {
    for value in properties.values_mut() {
        truncate_value(value, max_length);
    }
}

fn truncate_value(value: &mut Value, max_length: usize) {
    match value {
        Value::String(s) => {
            if s.chars().count() > max_length {
                *s = s.chars().take(max_length).collect();
            }
        }
        Value::Array(items) => {
            for item in items {
                truncate_value(item, max_length);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                truncate_value(item, max_length);
            }
        }
        _ => {}
    }
}
