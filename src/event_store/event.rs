//! Event model
//!
//! Stored and staged event shapes, tags, and log cursors.

use chrono::{DateTime, Utc};

use super::EventStoreError;

/// Maximum byte length of an event type identifier
pub const MAX_EVENT_TYPE_LEN: usize = 64;

/// One `(key, value)` pair attached to an event
///
/// Storage encoding is the string `key=value` inside a `TEXT[]` column; the
/// key therefore must not contain `=`. The same key may appear on an event
/// multiple times.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Validate key and value: non-empty ASCII, key free of `=`
    pub fn validate(&self) -> Result<(), EventStoreError> {
        if self.key.is_empty() {
            return Err(EventStoreError::InvalidInput("empty tag key".into()));
        }
        if self.value.is_empty() {
            return Err(EventStoreError::InvalidInput(format!(
                "empty value for tag key '{}'",
                self.key
            )));
        }
        if !self.key.is_ascii() || !self.value.is_ascii() {
            return Err(EventStoreError::InvalidInput(format!(
                "non-ASCII tag '{}'",
                self.key
            )));
        }
        if self.key.contains('=') {
            return Err(EventStoreError::InvalidInput(format!(
                "tag key '{}' contains '='",
                self.key
            )));
        }
        Ok(())
    }

    /// Storage form, `key=value`
    pub fn encode(&self) -> String {
        format!("{}={}", self.key, self.value)
    }

    /// Parse the storage form at the first `=`
    pub fn parse(encoded: &str) -> Result<Self, EventStoreError> {
        match encoded.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Self::new(key, value)),
            _ => Err(EventStoreError::InvalidInput(format!(
                "malformed stored tag '{encoded}'"
            ))),
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// An event staged for insertion
///
/// `position`, `transaction_id` and `occurred_at` are assigned atomically at
/// commit; the payload is an opaque byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEvent {
    pub event_type: String,
    pub tags: Vec<Tag>,
    pub data: Vec<u8>,
}

impl AppendEvent {
    pub fn new(event_type: impl Into<String>, tags: Vec<Tag>, data: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            tags,
            data,
        }
    }

    pub fn validate(&self) -> Result<(), EventStoreError> {
        validate_event_type(&self.event_type)?;
        for tag in &self.tags {
            tag.validate()?;
        }
        Ok(())
    }

    pub(crate) fn encoded_tags(&self) -> Vec<String> {
        self.tags.iter().map(Tag::encode).collect()
    }
}

pub(crate) fn validate_event_type(event_type: &str) -> Result<(), EventStoreError> {
    if event_type.is_empty() {
        return Err(EventStoreError::InvalidInput("empty event type".into()));
    }
    if !event_type.is_ascii() {
        return Err(EventStoreError::InvalidInput(format!(
            "non-ASCII event type '{event_type}'"
        )));
    }
    if event_type.len() > MAX_EVENT_TYPE_LEN {
        return Err(EventStoreError::InvalidInput(format!(
            "event type longer than {MAX_EVENT_TYPE_LEN} bytes"
        )));
    }
    Ok(())
}

/// Stored event read back from the log, immutable once persisted
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_type: String,
    pub tags: Vec<Tag>,
    pub data: Vec<u8>,
    pub transaction_id: i64,
    pub position: i64,
    pub occurred_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Cursor naming this event's point in the log
    pub fn cursor(&self) -> Cursor {
        Cursor {
            position: self.position,
            transaction_id: self.transaction_id,
        }
    }

    /// First value stored under `key`, if any
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    pub(crate) fn from_row(
        event_type: String,
        raw_tags: Vec<String>,
        data: Vec<u8>,
        transaction_id: i64,
        position: i64,
        occurred_at: DateTime<Utc>,
    ) -> Result<Self, EventStoreError> {
        let tags = raw_tags
            .iter()
            .map(|t| Tag::parse(t))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            event_type,
            tags,
            data,
            transaction_id,
            position,
            occurred_at,
        })
    }
}

/// A point in the log "after which" conditions are evaluated
///
/// Streams are ordered by `(transaction_id, position)`; `position = 0`
/// denotes the empty log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Cursor {
    pub position: i64,
    pub transaction_id: i64,
}

impl Cursor {
    /// The beginning of the log
    pub fn origin() -> Self {
        Self {
            position: 0,
            transaction_id: 0,
        }
    }

    pub fn new(position: i64, transaction_id: i64) -> Self {
        Self {
            position,
            transaction_id,
        }
    }

    pub fn is_origin(&self) -> bool {
        self.position == 0
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::origin()
    }
}
