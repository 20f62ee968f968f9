use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::hash::{Hash, Hasher};

pub const JSONRPC_VERSION: &str = "2.0";

/// Local identifier correlating an outbound request with its responses.
pub type RequestId = u16;

/// Outbound JSON-RPC request envelope
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

impl Request {
    /// Build a request. Missing params are sent as an empty positional list,
    /// which is what substrate-style nodes expect for parameterless methods.
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params: params.unwrap_or_else(|| Value::Array(Vec::new())),
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Server-assigned subscription handle.
///
/// Nodes hand these out as strings or numbers. Both forms are keyed by their
/// textual rendering so a push tagged `"5"` and one tagged `5` resolve to the
/// same subscription, while the original JSON value is kept for echoing back
/// in unsubscribe calls.
#[derive(Debug, Clone)]
pub struct RemoteId {
    key: String,
    raw: Value,
}

impl RemoteId {
    pub fn from_value(value: &Value) -> Option<Self> {
        let key = match value {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self {
            key,
            raw: value.clone(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn to_value(&self) -> Value {
        self.raw.clone()
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self {
            key: s.to_string(),
            raw: Value::String(s.to_string()),
        }
    }
}

impl PartialEq for RemoteId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RemoteId {}

impl Hash for RemoteId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = Request::new(1, "chain_getHeader", None);
        let json = req.to_frame().unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"chain_getHeader\""));
        assert!(json.contains("\"params\":[]"));
    }

    #[test]
    fn test_request_keeps_object_params() {
        let req = Request::new(3, "author_submit", Some(json!({"tx": "0x00"})));
        let value: Value = serde_json::from_str(&req.to_frame().unwrap()).unwrap();
        assert_eq!(value["params"]["tx"], "0x00");
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::new(METHOD_NOT_FOUND, "Method not found");
        assert_eq!(err.to_string(), "RPC error -32601: Method not found");
    }

    #[test]
    fn test_rpc_error_skips_missing_data() {
        let json = serde_json::to_string(&RpcError::new(INTERNAL_ERROR, "boom")).unwrap();
        assert!(!json.contains("data"));
    }

    #[test]
    fn test_remote_id_string_and_number_match() {
        let a = RemoteId::from_value(&json!("5")).unwrap();
        let b = RemoteId::from_value(&json!(5)).unwrap();
        assert_eq!(a, b);
        assert_eq!(b.to_value(), json!(5));
        assert_eq!(a.to_value(), json!("5"));
    }

    #[test]
    fn test_remote_id_rejects_other_shapes() {
        assert!(RemoteId::from_value(&json!(null)).is_none());
        assert!(RemoteId::from_value(&json!("")).is_none());
        assert!(RemoteId::from_value(&json!({"id": 1})).is_none());
    }
}
