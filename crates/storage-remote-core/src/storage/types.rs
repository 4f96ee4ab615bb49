//! Data types exchanged with storage instances
//!
//! All types are plain serde records so they can travel inside
//! message envelopes unchanged.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Parameters used to create a storage instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCreationParams {
    pub database_name: String,
    pub collection_name: String,
    /// Collection schema, opaque to the protocol
    #[serde(default)]
    pub schema: Value,
    /// Engine-specific options
    #[serde(default)]
    pub options: Value,
    /// Whether several instances may operate on the same collection
    #[serde(default)]
    pub multi_instance: bool,
}

impl InstanceCreationParams {
    pub fn new(database_name: impl Into<String>, collection_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            collection_name: collection_name.into(),
            schema: Value::Null,
            options: Value::Null,
            multi_instance: false,
        }
    }

    /// Key identifying the collection this instance operates on
    pub fn collection_key(&self) -> String {
        format!("{}--{}", self.database_name, self.collection_name)
    }
}

/// Metadata of a stored attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub digest: String,
    pub length: u64,
    pub content_type: String,
    /// Base64 payload, only present on writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// A document as stored by a storage instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDocument {
    /// Primary key
    pub id: String,
    /// Revision, `<height>-<token>`
    pub rev: String,
    #[serde(default)]
    pub deleted: bool,
    /// Last write time in milliseconds since the epoch
    pub last_write_time: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, AttachmentMeta>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StorageDocument {
    /// Create the first revision of a document
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: new_revision(0),
            deleted: false,
            last_write_time: Utc::now().timestamp_millis(),
            attachments: BTreeMap::new(),
            data,
        }
    }

    /// Derive the next revision of this document
    pub fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.rev = new_revision(self.revision_height());
        next.last_write_time = Utc::now().timestamp_millis().max(self.last_write_time + 1);
        next
    }

    /// Numeric height of the revision (`3` for `3-abc`)
    pub fn revision_height(&self) -> u64 {
        self.rev
            .split_once('-')
            .and_then(|(height, _)| height.parse().ok())
            .unwrap_or(0)
    }

    /// Get a top-level data field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

fn new_revision(previous_height: u64) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("{}-{}", previous_height + 1, &token[..10])
}

/// A single write in a bulk write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteRow {
    pub document: StorageDocument,
    /// The revision the writer based its change on; `None` for inserts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<StorageDocument>,
}

impl BulkWriteRow {
    pub fn insert(document: StorageDocument) -> Self {
        Self {
            document,
            previous: None,
        }
    }

    pub fn update(previous: StorageDocument, document: StorageDocument) -> Self {
        Self {
            document,
            previous: Some(previous),
        }
    }
}

/// A rejected write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteError {
    /// HTTP-like status, 409 for conflicts
    pub status: u16,
    pub document_id: String,
    pub is_error: bool,
    /// Current state of the document when it conflicted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_in_db: Option<StorageDocument>,
}

impl WriteError {
    pub fn conflict(document_id: impl Into<String>, document_in_db: Option<StorageDocument>) -> Self {
        Self {
            status: 409,
            document_id: document_id.into(),
            is_error: true,
            document_in_db,
        }
    }
}

/// Result of a bulk write
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteResponse {
    pub success: Vec<StorageDocument>,
    pub error: Vec<WriteError>,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Sort on a single field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
}

/// Query as handed to the engine
///
/// Matching and sorting semantics belong to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedQuery {
    #[serde(default)]
    pub selector: Map<String, Value>,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl PreparedQuery {
    /// Match every non-deleted document
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality condition
    pub fn with_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.selector.insert(field.into(), value);
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortField {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub documents: Vec<StorageDocument>,
}

/// How a count was computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountMode {
    Fast,
    Slow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResult {
    pub count: usize,
    pub mode: CountMode,
}

/// Position in the change history of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub lwt: i64,
}

impl Checkpoint {
    pub fn of(document: &StorageDocument) -> Self {
        Self {
            id: document.id.clone(),
            lwt: document.last_write_time,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangedDocuments {
    pub documents: Vec<StorageDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

/// Kind of change recorded in a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A single document change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub document_id: String,
    pub document_data: StorageDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_document_data: Option<StorageDocument>,
}

/// All changes produced by one write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEventBulk {
    pub id: String,
    pub events: Vec<ChangeEvent>,
    pub checkpoint: Checkpoint,
    /// Context string passed to the write that caused the changes
    pub context: String,
    pub start_time: i64,
    pub end_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_revision_height() {
        let doc = StorageDocument::new("a", data(json!({"n": 1})));
        assert_eq!(doc.revision_height(), 1);

        let next = doc.next_revision();
        assert_eq!(next.revision_height(), 2);
        assert_ne!(next.rev, doc.rev);
        assert!(next.last_write_time > doc.last_write_time);
    }

    #[test]
    fn test_document_wire_shape() {
        let doc = StorageDocument::new("a", data(json!({"title": "hello"})));
        let value = serde_json::to_value(&doc).unwrap();

        assert_eq!(value["id"], "a");
        assert!(value.get("lastWriteTime").is_some());
        assert!(value.get("attachments").is_none());
        assert_eq!(value["data"]["title"], "hello");
    }

    #[test]
    fn test_creation_params_defaults() {
        let params: InstanceCreationParams =
            serde_json::from_value(json!({"databaseName": "db", "collectionName": "heroes"}))
                .unwrap();
        assert_eq!(params.collection_key(), "db--heroes");
        assert!(!params.multi_instance);
        assert!(params.schema.is_null());
    }

    #[test]
    fn test_change_operation_names() {
        let value = serde_json::to_value(ChangeOperation::Delete).unwrap();
        assert_eq!(value, "DELETE");
    }
}
