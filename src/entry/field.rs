use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::entry::Entry;
use crate::error::{Error, Result};

const RECORD_PREFIX: &str = "$record";
const LABELS_PREFIX: &str = "$labels";

/// Field addresses a location on an entry, either a path into the record
/// tree or a single label key. It is used by operators to get, set, and
/// delete values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    /// A path into the record; an empty path addresses the record root
    Record(Vec<String>),
    /// A label by key
    Label(String),
}

impl Field {
    pub fn record(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Field::Record(keys.into_iter().map(|k| k.into()).collect())
    }

    pub fn root_record() -> Self {
        Field::Record(vec![])
    }

    pub fn label(key: impl Into<String>) -> Self {
        Field::Label(key.into())
    }

    /// Parse a field from dot notation. `$labels.<key>` addresses a label,
    /// `$record.` or a bare path addresses the record. Keys containing dots
    /// use bracket access: `$record['some.key']`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts = split_field(s)?;

        if parts.is_empty() {
            return Err(Error::Field("empty field".to_string()));
        }

        match parts[0].as_str() {
            LABELS_PREFIX => {
                if parts.len() != 2 {
                    return Err(Error::Field(format!(
                        "labels must be addressed as {}.<key>",
                        LABELS_PREFIX
                    )));
                }
                Ok(Field::Label(parts[1].clone()))
            }
            RECORD_PREFIX => Ok(Field::Record(parts[1..].to_vec())),
            _ => Ok(Field::Record(parts)),
        }
    }

    /// Read the value at this field, if present. Label values are returned
    /// as string values.
    pub fn get(&self, entry: &Entry) -> Option<Value> {
        match self {
            Field::Label(key) => entry.labels.get(key).cloned().map(Value::String),
            Field::Record(keys) => {
                let mut current = &entry.record;
                for key in keys {
                    current = current.get(key)?;
                }
                Some(current.clone())
            }
        }
    }

    /// Write a value at this field, creating intermediate maps as needed.
    /// Fails with a type mismatch when the path traverses a non-map value,
    /// or when a non-string value is written to a label.
    pub fn set(&self, entry: &mut Entry, value: Value) -> Result<()> {
        match self {
            Field::Label(key) => match value {
                Value::String(s) => {
                    entry.labels.insert(key.clone(), s);
                    Ok(())
                }
                other => Err(Error::TypeMismatch(format!(
                    "label '{}' requires a string value, got {}",
                    key,
                    value_kind(&other)
                ))),
            },
            Field::Record(keys) => {
                if keys.is_empty() {
                    entry.record = value;
                    return Ok(());
                }

                if entry.record.is_null() {
                    entry.record = Value::Object(serde_json::Map::new());
                }

                let mut current = &mut entry.record;
                for key in &keys[..keys.len() - 1] {
                    let map = current.as_object_mut().ok_or_else(|| {
                        Error::TypeMismatch(format!(
                            "cannot traverse non-map value at '{}' while setting field",
                            key
                        ))
                    })?;
                    current = map
                        .entry(key.clone())
                        .or_insert_with(|| Value::Object(serde_json::Map::new()));
                }

                let last = &keys[keys.len() - 1];
                let map = current.as_object_mut().ok_or_else(|| {
                    Error::TypeMismatch(format!(
                        "cannot set field '{}' through a non-map value",
                        last
                    ))
                })?;
                map.insert(last.clone(), value);
                Ok(())
            }
        }
    }

    /// Remove the value at this field, returning it if it was present.
    pub fn delete(&self, entry: &mut Entry) -> Option<Value> {
        match self {
            Field::Label(key) => entry.labels.remove(key).map(Value::String),
            Field::Record(keys) => {
                if keys.is_empty() {
                    return Some(std::mem::replace(&mut entry.record, Value::Null));
                }

                let mut current = &mut entry.record;
                for key in &keys[..keys.len() - 1] {
                    current = current.get_mut(key)?;
                }
                current.as_object_mut()?.remove(&keys[keys.len() - 1])
            }
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Label(key) => write!(f, "{}.{}", LABELS_PREFIX, key),
            Field::Record(keys) => {
                if keys.is_empty() {
                    return write!(f, "{}", RECORD_PREFIX);
                }
                if keys.iter().any(|k| k.contains('.')) {
                    write!(f, "{}", RECORD_PREFIX)?;
                    for key in keys {
                        write!(f, "['{}']", key)?;
                    }
                    Ok(())
                } else {
                    write!(f, "{}", keys.join("."))
                }
            }
        }
    }
}

impl Serialize for Field {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Field::parse(&s).map_err(serde::de::Error::custom)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

/// Parser state for splitting dot notation with bracket access
#[derive(Debug, Clone, Copy, PartialEq)]
enum SplitState {
    Begin,
    InBracket,
    InQuote,
    AfterQuote,
    AfterBracket,
    InToken,
}

fn split_field(s: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut state = SplitState::Begin;
    let mut quote = ' ';
    let mut start = 0;

    let chars: Vec<char> = s.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        match state {
            SplitState::Begin => {
                if c == '[' {
                    state = SplitState::InBracket;
                } else {
                    start = i;
                    state = SplitState::InToken;
                }
            }
            SplitState::InBracket => {
                if c != '\'' && c != '"' {
                    return Err(Error::Field(
                        "strings in brackets must be quoted".to_string(),
                    ));
                }
                quote = c;
                start = i + 1;
                state = SplitState::InQuote;
            }
            SplitState::InQuote => {
                if c == quote {
                    parts.push(chars[start..i].iter().collect());
                    state = SplitState::AfterQuote;
                }
            }
            SplitState::AfterQuote => {
                if c != ']' {
                    return Err(Error::Field(
                        "unexpected characters between quote and closing bracket".to_string(),
                    ));
                }
                state = SplitState::AfterBracket;
            }
            SplitState::AfterBracket => match c {
                '.' => {
                    start = i + 1;
                    state = SplitState::InToken;
                }
                '[' => state = SplitState::InBracket,
                _ => {
                    return Err(Error::Field(
                        "bracket access must be followed by a dot or another bracket".to_string(),
                    ));
                }
            },
            SplitState::InToken => {
                if c == '.' {
                    parts.push(chars[start..i].iter().collect());
                    start = i + 1;
                } else if c == '[' {
                    parts.push(chars[start..i].iter().collect());
                    state = SplitState::InBracket;
                }
            }
        }
    }

    match state {
        SplitState::InBracket | SplitState::AfterQuote => {
            Err(Error::Field("unclosed bracket".to_string()))
        }
        SplitState::InQuote => Err(Error::Field("unclosed quote".to_string())),
        SplitState::InToken => {
            parts.push(chars[start..].iter().collect());
            Ok(parts)
        }
        _ => Ok(parts),
    }
}
