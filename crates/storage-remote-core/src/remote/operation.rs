//! Operation set
//!
//! The closed set of operations a remote storage instance accepts. The wire
//! carries the method as a string and its parameters as a JSON object; both
//! are mapped to [`StorageCall`] at the boundary and nowhere else.

use std::fmt;
use std::str::FromStr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{StorageError, StorageResult};
use crate::storage::{BulkWriteRow, Checkpoint, PreparedQuery, StorageInstance};

/// Operations of a storage instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMethod {
    BulkWrite,
    FindDocumentsById,
    Query,
    Count,
    GetAttachmentData,
    GetChangedDocumentsSince,
    Cleanup,
    Close,
    Remove,
}

impl StorageMethod {
    pub const ALL: [StorageMethod; 9] = [
        Self::BulkWrite,
        Self::FindDocumentsById,
        Self::Query,
        Self::Count,
        Self::GetAttachmentData,
        Self::GetChangedDocumentsSince,
        Self::Cleanup,
        Self::Close,
        Self::Remove,
    ];

    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BulkWrite => "bulkWrite",
            Self::FindDocumentsById => "findDocumentsById",
            Self::Query => "query",
            Self::Count => "count",
            Self::GetAttachmentData => "getAttachmentData",
            Self::GetChangedDocumentsSince => "getChangedDocumentsSince",
            Self::Cleanup => "cleanup",
            Self::Close => "close",
            Self::Remove => "remove",
        }
    }

    /// Whether the method ends the session
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::Close | Self::Remove)
    }
}

impl fmt::Display for StorageMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMethod {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| StorageError::UnknownMethod(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkWriteParams {
    pub document_writes: Vec<BulkWriteRow>,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindDocumentsByIdParams {
    pub ids: Vec<String>,
    #[serde(default)]
    pub with_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    pub query: PreparedQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAttachmentDataParams {
    pub document_id: String,
    pub attachment_id: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChangedDocumentsSinceParams {
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupParams {
    pub minimum_deleted_time: i64,
}

/// A decoded operation call
#[derive(Debug, Clone, PartialEq)]
pub enum StorageCall {
    BulkWrite(BulkWriteParams),
    FindDocumentsById(FindDocumentsByIdParams),
    Query(QueryParams),
    Count(QueryParams),
    GetAttachmentData(GetAttachmentDataParams),
    GetChangedDocumentsSince(GetChangedDocumentsSinceParams),
    Cleanup(CleanupParams),
    Close,
    Remove,
}

impl StorageCall {
    pub fn method(&self) -> StorageMethod {
        match self {
            Self::BulkWrite(_) => StorageMethod::BulkWrite,
            Self::FindDocumentsById(_) => StorageMethod::FindDocumentsById,
            Self::Query(_) => StorageMethod::Query,
            Self::Count(_) => StorageMethod::Count,
            Self::GetAttachmentData(_) => StorageMethod::GetAttachmentData,
            Self::GetChangedDocumentsSince(_) => StorageMethod::GetChangedDocumentsSince,
            Self::Cleanup(_) => StorageMethod::Cleanup,
            Self::Close => StorageMethod::Close,
            Self::Remove => StorageMethod::Remove,
        }
    }

    /// Decode a call from its wire method and params
    pub fn from_wire(method: &str, params: Value) -> StorageResult<Self> {
        let method: StorageMethod = method.parse()?;
        let call = match method {
            StorageMethod::BulkWrite => Self::BulkWrite(decode(method, params)?),
            StorageMethod::FindDocumentsById => Self::FindDocumentsById(decode(method, params)?),
            StorageMethod::Query => Self::Query(decode(method, params)?),
            StorageMethod::Count => Self::Count(decode(method, params)?),
            StorageMethod::GetAttachmentData => Self::GetAttachmentData(decode(method, params)?),
            StorageMethod::GetChangedDocumentsSince => {
                Self::GetChangedDocumentsSince(decode(method, params)?)
            }
            StorageMethod::Cleanup => Self::Cleanup(decode(method, params)?),
            StorageMethod::Close => Self::Close,
            StorageMethod::Remove => Self::Remove,
        };
        Ok(call)
    }

    /// Encode the params for the wire
    pub fn to_params(&self) -> StorageResult<Value> {
        let params = match self {
            Self::BulkWrite(p) => serde_json::to_value(p)?,
            Self::FindDocumentsById(p) => serde_json::to_value(p)?,
            Self::Query(p) | Self::Count(p) => serde_json::to_value(p)?,
            Self::GetAttachmentData(p) => serde_json::to_value(p)?,
            Self::GetChangedDocumentsSince(p) => serde_json::to_value(p)?,
            Self::Cleanup(p) => serde_json::to_value(p)?,
            Self::Close | Self::Remove => json!({}),
        };
        Ok(params)
    }

    /// Run the call against an instance and encode its result
    pub async fn invoke(self, instance: &dyn StorageInstance) -> StorageResult<Value> {
        let result = match self {
            Self::BulkWrite(p) => {
                serde_json::to_value(instance.bulk_write(p.document_writes, &p.context).await?)
            }
            Self::FindDocumentsById(p) => serde_json::to_value(
                instance.find_documents_by_id(p.ids, p.with_deleted).await?,
            ),
            Self::Query(p) => serde_json::to_value(instance.query(p.query).await?),
            Self::Count(p) => serde_json::to_value(instance.count(p.query).await?),
            Self::GetAttachmentData(p) => serde_json::to_value(
                instance
                    .get_attachment_data(&p.document_id, &p.attachment_id, &p.digest)
                    .await?,
            ),
            Self::GetChangedDocumentsSince(p) => serde_json::to_value(
                instance
                    .get_changed_documents_since(p.limit, p.checkpoint)
                    .await?,
            ),
            Self::Cleanup(p) => serde_json::to_value(instance.cleanup(p.minimum_deleted_time).await?),
            Self::Close => {
                instance.close().await?;
                Ok(Value::Null)
            }
            Self::Remove => {
                instance.remove().await?;
                Ok(Value::Null)
            }
        };
        result.map_err(|e| StorageError::Internal(format!("failed to encode result: {}", e)))
    }
}

fn decode<T: DeserializeOwned>(method: StorageMethod, params: Value) -> StorageResult<T> {
    serde_json::from_value(params)
        .map_err(|e| StorageError::InvalidParams(format!("{}: {}", method, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_round_trip() {
        for method in StorageMethod::ALL {
            assert_eq!(method.as_str().parse::<StorageMethod>().unwrap(), method);
        }
    }

    #[test]
    fn test_unknown_method() {
        let err = "dropDatabase".parse::<StorageMethod>().unwrap_err();
        assert!(matches!(err, StorageError::UnknownMethod(ref m) if m == "dropDatabase"));

        // Reserved names are not operations
        assert!("create".parse::<StorageMethod>().is_err());
        assert!("changeStream".parse::<StorageMethod>().is_err());
    }

    #[test]
    fn test_from_wire_decodes_params() {
        let call = StorageCall::from_wire(
            "findDocumentsById",
            json!({"ids": ["a", "b"], "withDeleted": true}),
        )
        .unwrap();
        assert_eq!(
            call,
            StorageCall::FindDocumentsById(FindDocumentsByIdParams {
                ids: vec!["a".into(), "b".into()],
                with_deleted: true,
            })
        );
        assert_eq!(call.method(), StorageMethod::FindDocumentsById);
    }

    #[test]
    fn test_from_wire_invalid_params() {
        let err = StorageCall::from_wire("cleanup", json!({"minimumDeletedTime": "soon"}))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidParams(ref m) if m.starts_with("cleanup")));
    }

    #[test]
    fn test_params_round_trip_through_wire() {
        let call = StorageCall::GetChangedDocumentsSince(GetChangedDocumentsSinceParams {
            limit: 10,
            checkpoint: Some(Checkpoint {
                id: "a".into(),
                lwt: 5,
            }),
        });
        let params = call.to_params().unwrap();
        assert_eq!(params["checkpoint"]["lwt"], 5);

        let decoded = StorageCall::from_wire(call.method().as_str(), params).unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn test_close_ignores_params() {
        let call = StorageCall::from_wire("close", Value::Null).unwrap();
        assert_eq!(call, StorageCall::Close);
        assert!(call.method().ends_session());
    }
}
