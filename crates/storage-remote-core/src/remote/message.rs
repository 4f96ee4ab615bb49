//! Wire message types
//!
//! Two envelopes cross the bus: [`MessageToRemote`] from proxy to exposer and
//! [`MessageFromRemote`] back. Both are plain serde records with camelCase
//! field names so any transport able to carry JSON or CBOR can carry them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::RemoteError;

/// Method name of the session creation request
pub const CREATE_METHOD: &str = "create";

/// Method tag of pushed change events
pub const CHANGE_STREAM_METHOD: &str = "changeStream";

/// Connection id carried by the creation request and its reply
pub const NO_CONNECTION: &str = "";

/// Return value of a successful creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedInstance {
    /// Connection id allocated by the exposer
    pub connection_id: String,
}

/// Request sent to the exposer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageToRemote {
    /// Session id, [`NO_CONNECTION`] for creation
    pub connection_id: String,
    /// Unique id of the request
    pub request_id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl MessageToRemote {
    /// Create a session creation request
    pub fn create(request_id: impl Into<String>, params: Value) -> Self {
        Self {
            connection_id: NO_CONNECTION.to_string(),
            request_id: request_id.into(),
            method: CREATE_METHOD.to_string(),
            params,
        }
    }

    /// Create an operation request for an existing session
    pub fn call(
        connection_id: impl Into<String>,
        request_id: impl Into<String>,
        method: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            request_id: request_id.into(),
            method: method.into(),
            params,
        }
    }

    /// A creation request: the `create` method without a connection
    pub fn is_create(&self) -> bool {
        self.method == CREATE_METHOD && self.connection_id == NO_CONNECTION
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Vec<u8> {
        encode_cbor(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}

/// Reply or push event sent by the exposer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFromRemote {
    pub connection_id: String,
    /// Request id this message answers; absent for push events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_to: Option<String>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    /// `Some(Value::Null)` is a successful reply with a null result
    #[serde(
        rename = "return",
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
}

impl MessageFromRemote {
    /// Successful reply to `request`
    pub fn success(request: &MessageToRemote, result: Value) -> Self {
        Self {
            connection_id: request.connection_id.clone(),
            answer_to: Some(request.request_id.clone()),
            method: request.method.clone(),
            error: None,
            result: Some(result),
        }
    }

    /// Failed reply to `request`
    pub fn failure(request: &MessageToRemote, error: RemoteError) -> Self {
        Self {
            connection_id: request.connection_id.clone(),
            answer_to: Some(request.request_id.clone()),
            method: request.method.clone(),
            error: Some(error),
            result: None,
        }
    }

    /// Push event carrying a change event bulk
    pub fn change_event(connection_id: impl Into<String>, bulk: Value) -> Self {
        Self {
            connection_id: connection_id.into(),
            answer_to: None,
            method: CHANGE_STREAM_METHOD.to_string(),
            error: None,
            result: Some(bulk),
        }
    }

    /// Classify the message; replies and push events never mix
    pub fn classify(self) -> IncomingMessage {
        let is_push = self.answer_to.as_deref().map_or(true, str::is_empty);

        if is_push {
            let valid = self.method == CHANGE_STREAM_METHOD
                && self.error.is_none()
                && self.result.is_some();
            if !valid {
                return IncomingMessage::Malformed(self);
            }
            return IncomingMessage::Event(PushEvent {
                connection_id: self.connection_id,
                payload: self.result.unwrap_or_default(),
            });
        }

        // Exactly one of error/return
        if self.error.is_some() == self.result.is_some() {
            return IncomingMessage::Malformed(self);
        }

        let outcome = match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or_default()),
        };
        IncomingMessage::Reply(Reply {
            connection_id: self.connection_id,
            answer_to: self.answer_to.unwrap_or_default(),
            method: self.method,
            outcome,
        })
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Vec<u8> {
        encode_cbor(self)
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}

/// An incoming message after classification
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Answer to a request
    Reply(Reply),
    /// Unsolicited change notification
    Event(PushEvent),
    /// Reply with both or neither of `error`/`return`, or an untagged push
    Malformed(MessageFromRemote),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub connection_id: String,
    pub answer_to: String,
    pub method: String,
    pub outcome: Result<Value, RemoteError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub connection_id: String,
    pub payload: Value,
}

/// Keep an explicit `null` as `Some(Value::Null)`
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn encode_cbor<T: Serialize>(value: &T) -> Vec<u8> {
    let mut bytes = Vec::new();
    // Writing into a Vec cannot fail for these plain records
    let _ = ciborium::into_writer(value, &mut bytes);
    bytes
}
