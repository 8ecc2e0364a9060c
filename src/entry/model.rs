use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Entry is the unit of data flowing through the operator graph: a
/// timestamped record plus a flat set of labels.
///
/// Entries are immutable once emitted. An operator that wants to modify one
/// must clone it first; `Entry` clones are deep because the record tree
/// clones structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// When the log event occurred
    pub timestamp: DateTime<Utc>,

    /// The record body, a tree of maps, arrays and scalars
    pub record: Value,

    /// Flat string metadata attached to the entry
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl Entry {
    /// Create a new entry with the current timestamp and a null record
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            record: Value::Null,
            labels: HashMap::new(),
        }
    }

    /// Create a new entry with the given record value
    pub fn with_record(record: impl Into<Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            record: record.into(),
            labels: HashMap::new(),
        }
    }

    pub fn add_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    /// Get the record as a string if it is one
    pub fn record_string(&self) -> Option<&str> {
        self.record.as_str()
    }

    /// Convenience accessor for the common `{ "message": ... }` record shape
    pub fn message(&self) -> Option<&str> {
        self.record.get("message").and_then(|v| v.as_str())
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}
