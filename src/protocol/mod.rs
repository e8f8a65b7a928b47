//! JSON-RPC 2.0 envelope representations and formatting utilities
//!
//! Everything that crosses a transport is built or taken apart here: envelope
//! classification for inbound frames and reply/notification construction for
//! outbound ones.

pub mod types;
pub mod uri_template;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revisions this server speaks, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
pub const NOTIFICATION_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
pub const NOTIFICATION_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
pub const NOTIFICATION_RESOURCE_UPDATED: &str = "notifications/resources/updated";

/// A JSON-RPC request id. The wire type (string or integer) is preserved so
/// replies carry exactly the id the caller sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl RequestId {
    /// Extracts an id from a raw envelope value. `null` counts as absent;
    /// anything but a string or integer is unusable.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            _ => None,
        }
    }
}

/// The `error` member of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// An inbound frame, classified by member presence: `method` with an id is a
/// request, `method` alone is a notification, an id with `result` or `error`
/// is a response.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Option<Value>,
        error: Option<RpcError>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EnvelopeError {
    #[error("envelope is not a JSON object")]
    NotObject,
    #[error("jsonrpc member is missing or not \"2.0\"")]
    BadVersion,
    #[error("id member is neither a string nor an integer")]
    BadId,
    #[error("method member is empty")]
    EmptyMethod,
    #[error("envelope carries neither a method nor a result/error")]
    Unclassifiable,
}

impl Message {
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let object = value.as_object().ok_or(EnvelopeError::NotObject)?;

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(EnvelopeError::BadVersion);
        }

        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(RequestId::from_value(raw).ok_or(EnvelopeError::BadId)?),
        };
        let method = object.get("method").and_then(Value::as_str);
        let params = object.get("params").cloned();

        if let Some(method) = method {
            if method.trim().is_empty() {
                return Err(EnvelopeError::EmptyMethod);
            }
            let method = method.to_string();
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        let result = object.get("result").cloned();
        let error = match object.get("error") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value(raw.clone()).map_err(|_| EnvelopeError::Unclassifiable)?,
            ),
        };

        match (id, result.is_some() || error.is_some()) {
            (Some(id), true) => Ok(Self::Response { id, result, error }),
            _ => Err(EnvelopeError::Unclassifiable),
        }
    }
}

pub fn result_envelope(id: &RequestId, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn error_envelope(id: Option<&RequestId>, error: &RpcError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}

pub fn request_envelope(id: &RequestId, method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        }),
        None => json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "method": method,
        }),
    }
}

pub fn notification_envelope(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params,
        }),
        None => json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
        }),
    }
}

/// Picks the protocol version echoed back from `initialize`. A supported
/// offer is accepted as-is; anything else is answered with the newest
/// revision this server speaks.
pub fn negotiate_protocol_version(offered: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|supported| **supported == offered)
        .copied()
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_request_notification_and_response() {
        let request = Message::from_value(&json!({
            "jsonrpc": "2.0", "id": 1, "method": "ping"
        }))
        .expect("request");
        assert_eq!(
            request,
            Message::Request {
                id: RequestId::Number(1),
                method: "ping".to_string(),
                params: None
            }
        );

        let notification = Message::from_value(&json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }))
        .expect("notification");
        assert!(matches!(notification, Message::Notification { .. }));

        let response = Message::from_value(&json!({
            "jsonrpc": "2.0", "id": "abc", "result": {}
        }))
        .expect("response");
        assert!(matches!(
            response,
            Message::Response { id: RequestId::String(_), .. }
        ));
    }

    #[test]
    fn rejects_missing_version_and_bad_id() {
        assert_eq!(
            Message::from_value(&json!({"id": 1, "method": "ping"})),
            Err(EnvelopeError::BadVersion)
        );
        assert_eq!(
            Message::from_value(&json!({"jsonrpc": "2.0", "id": [1], "method": "ping"})),
            Err(EnvelopeError::BadId)
        );
        assert_eq!(
            Message::from_value(&json!({"jsonrpc": "2.0", "id": 2})),
            Err(EnvelopeError::Unclassifiable)
        );
    }

    #[test]
    fn string_and_integer_ids_round_trip_unchanged() {
        let reply = result_envelope(&RequestId::String("req-1".into()), json!({}));
        assert_eq!(reply["id"], json!("req-1"));

        let reply = result_envelope(&RequestId::Number(42), json!({}));
        assert_eq!(reply["id"], json!(42));
    }

    #[test]
    fn error_envelope_with_no_id_serializes_null() {
        let error = RpcError {
            code: -32700,
            message: "Parse error".to_string(),
            data: None,
        };
        let reply = error_envelope(None, &error);
        assert!(reply["id"].is_null());
        assert_eq!(reply["error"]["code"], json!(-32700));
    }

    #[test]
    fn negotiation_accepts_supported_and_downgrades_unknown() {
        assert_eq!(negotiate_protocol_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_protocol_version("2099-01-01"), "2025-03-26");
    }
}
