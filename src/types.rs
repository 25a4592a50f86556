//! Core types for the event store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};
use crate::query::Document;

/// Field holding the entity identity on both events and snapshots.
pub const ID_FIELD: &str = "id";

/// Field holding the revision stamp on both events and snapshots.
pub const REVISION_FIELD: &str = "revision";

/// Field holding the snapshot watermark.
pub const VERSION_FIELD: &str = "version";

/// Storage-assigned identifier field.
pub const STORAGE_ID_FIELD: &str = "_id";

/// Caller-assigned entity identity.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identity {
    Num(i64),
    Str(String),
}

impl Identity {
    /// An identity is usable when it is a non-empty string or a non-zero number.
    pub fn is_valid(&self) -> bool {
        match self {
            Identity::Num(n) => *n != 0,
            Identity::Str(s) => !s.is_empty(),
        }
    }

    /// JSON form used in queries.
    pub fn to_value(&self) -> Value {
        match self {
            Identity::Num(n) => Value::from(*n),
            Identity::Str(s) => Value::from(s.as_str()),
        }
    }

    /// Parse an identity out of a stored value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Identity::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Identity::Num),
            _ => None,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Num(n) => write!(f, "Identity({})", n),
            Identity::Str(s) => write!(f, "Identity({:?})", s),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Num(n) => write!(f, "{}", n),
            Identity::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity::Str(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity::Str(s)
    }
}

impl From<i64> for Identity {
    fn from(n: i64) -> Self {
        Identity::Num(n)
    }
}

/// Count of events ever recorded against an entity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rev({})", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Revision {
    pub fn next(self) -> Self {
        Revision(self.0 + 1)
    }

    /// Number of revisions between `self` and an older watermark.
    pub fn since(self, watermark: Revision) -> u64 {
        self.0.saturating_sub(watermark.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single domain event as stored in the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Identifier assigned by the collection (absent until stored).
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<String>,

    /// Entity this event belongs to.
    pub id: Identity,

    /// Entity revision at the time the event was recorded.
    pub revision: Revision,

    /// Application-defined event name (e.g. "start").
    pub name: String,

    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,

    /// When the event was recorded.
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl EventRecord {
    pub fn new(id: Identity, revision: Revision, name: impl Into<String>, payload: Value) -> Self {
        Self {
            storage_id: None,
            id,
            revision,
            name: name.into(),
            payload,
            timestamp: Timestamp::now(),
        }
    }

    /// Decode an event out of a stored document.
    pub fn from_document(doc: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(doc))
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// Encode for writing, with any storage identifier stripped.
    pub fn to_document(&self) -> Result<Document> {
        to_document(&Self {
            storage_id: None,
            ..self.clone()
        })
    }
}

/// Point-in-time entity state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Identifier assigned by the collection (absent until stored).
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<String>,

    /// Entity this snapshot belongs to.
    pub id: Identity,

    /// Revision of the last event folded into `state`.
    pub revision: Revision,

    /// Watermark the entity carried when the snapshot was taken.
    pub version: Revision,

    /// Serialized entity state.
    pub state: Value,

    /// When the snapshot was taken.
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl SnapshotRecord {
    pub fn from_document(doc: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(doc))
            .map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    pub fn to_document(&self) -> Result<Document> {
        to_document(&Self {
            storage_id: None,
            ..self.clone()
        })
    }
}

fn to_document(value: &impl Serialize) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_validity() {
        assert!(Identity::from("t1").is_valid());
        assert!(Identity::from(7i64).is_valid());
        assert!(!Identity::from("").is_valid());
        assert!(!Identity::from(0i64).is_valid());
    }

    #[test]
    fn test_identity_untagged_serde() {
        assert_eq!(serde_json::to_value(Identity::from("x")).unwrap(), json!("x"));
        assert_eq!(serde_json::to_value(Identity::from(3i64)).unwrap(), json!(3));
        let parsed: Identity = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(parsed, Identity::Num(42));
    }

    #[test]
    fn test_revision_since() {
        assert_eq!(Revision(12).since(Revision(2)), 10);
        assert_eq!(Revision(1).since(Revision(5)), 0);
        assert_eq!(Revision(4).next(), Revision(5));
    }

    #[test]
    fn test_event_document_strips_storage_id() {
        let mut event = EventRecord::new("a".into(), Revision(1), "init", json!({}));
        event.storage_id = Some("abc".into());

        let doc = event.to_document().unwrap();
        assert!(!doc.contains_key(STORAGE_ID_FIELD));
        assert_eq!(doc.get(REVISION_FIELD), Some(&json!(1)));
    }

    #[test]
    fn test_snapshot_from_document_reads_storage_id() {
        let doc = json!({
            "_id": "0001",
            "id": "x",
            "revision": 2,
            "version": 2,
            "state": {"status": "started"},
            "timestamp": 5
        });
        let Value::Object(doc) = doc else { unreachable!() };
        let snap = SnapshotRecord::from_document(doc).unwrap();
        assert_eq!(snap.storage_id.as_deref(), Some("0001"));
        assert_eq!(snap.revision, Revision(2));
    }
}
