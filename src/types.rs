//! Core types shared by the store, the live queries, and the write path.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Field map of a stored document.
pub type Fields = serde_json::Map<String, Value>;

/// Store-assigned document identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_string())
    }
}

/// Identifier of a store-side listener.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    pub fn as_millis(self) -> i64 {
        self.0 / 1000
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A timestamp written by the store at commit time.
///
/// `None` while the write is still pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerTimestamp(pub Option<Timestamp>);

impl ServerTimestamp {
    pub fn is_pending(&self) -> bool {
        self.0.is_none()
    }

    pub fn resolved(&self) -> Option<Timestamp> {
        self.0
    }
}

/// Slash-separated path to a collection: `posts` or `posts/{id}/comment`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Top-level collection.
    pub fn root(name: &str) -> Self {
        CollectionPath(name.to_string())
    }

    /// Parse and validate a collection path.
    ///
    /// A collection path has an odd number of non-empty segments.
    pub fn parse(path: &str) -> Result<Self> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) || segments.len() % 2 == 0 {
            return Err(SyncError::InvalidQuery(format!(
                "Not a collection path: {:?}",
                path
            )));
        }
        Ok(CollectionPath(path.to_string()))
    }

    /// Sub-collection scoped under one document of this collection.
    pub fn subcollection(&self, doc: &DocumentId, name: &str) -> Self {
        CollectionPath(format!("{}/{}/{}", self.0, doc.0, name))
    }

    /// The owning document for a sub-collection, `None` for a top-level one.
    pub fn parent(&self) -> Option<(CollectionPath, DocumentId)> {
        let mut parts = self.0.rsplitn(3, '/');
        let _name = parts.next()?;
        let doc = parts.next()?;
        let collection = parts.next()?;
        Some((CollectionPath(collection.to_string()), DocumentId(doc.to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionPath({})", self.0)
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sort direction for a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A standing query: one collection ordered by one field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub collection: CollectionPath,
    pub order_by: String,
    pub direction: Direction,
}

impl Query {
    pub fn new(collection: CollectionPath, order_by: impl Into<String>, direction: Direction) -> Self {
        Self {
            collection,
            order_by: order_by.into(),
            direction,
        }
    }

    /// Reject queries the store cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.order_by.is_empty() {
            return Err(SyncError::InvalidQuery("order_by must not be empty".into()));
        }
        Ok(())
    }

    /// Whether a document in this query's collection belongs to the result set.
    ///
    /// Documents without the order field are excluded.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.data.contains_key(&self.order_by)
    }

    /// Total order over matching documents, ties broken by id.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let by_field = compare_values(&a.order_value(&self.order_by), &b.order_value(&self.order_by));
        let by_field = match self.direction {
            Direction::Ascending => by_field,
            Direction::Descending => by_field.reverse(),
        };
        by_field.then_with(|| match self.direction {
            Direction::Ascending => a.id.cmp(&b.id),
            Direction::Descending => b.id.cmp(&a.id),
        })
    }
}

/// Rank of a JSON value's type in the sort order.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compare two field values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// A document as stored and delivered in snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub collection: CollectionPath,
    pub data: Fields,
    /// Commit time, or the store's estimate of it while pending.
    pub update_time: Timestamp,
    /// Server-assigned fields are not yet written.
    pub has_pending_writes: bool,
}

impl Document {
    /// Value used to sort by `field`. A pending server timestamp sorts at
    /// the store's estimated commit time.
    fn order_value(&self, field: &str) -> Value {
        match self.data.get(field) {
            Some(Value::Null) if self.has_pending_writes => Value::from(self.update_time.0),
            Some(v) => v.clone(),
            None => Value::Null,
        }
    }
}

/// Input for creating a document (before id and server fields are assigned).
#[derive(Clone, Debug, Default)]
pub struct NewDocument {
    pub fields: Fields,
    /// Fields the store fills with its commit timestamp.
    pub server_timestamps: Vec<String>,
}

impl NewDocument {
    /// Create a new document input from any serializable record.
    pub fn json(record: &impl Serialize) -> Result<Self> {
        match serde_json::to_value(record)? {
            Value::Object(fields) => Ok(Self {
                fields,
                server_timestamps: Vec::new(),
            }),
            other => Err(SyncError::Serialization(format!(
                "Document must be an object, got {}",
                other
            ))),
        }
    }

    /// Mark a field to be filled with the server timestamp at commit.
    pub fn with_server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.server_timestamps.push(field.into());
        self
    }
}
