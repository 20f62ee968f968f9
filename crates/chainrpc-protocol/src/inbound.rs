//! Classification of frames received from a node.
//!
//! A frame is either a response to one of our requests (carries an `id`) or
//! a subscription push (carries a `method` and `params.subscription`).

use crate::protocol::{RemoteId, RequestId, RpcError, JSONRPC_VERSION};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported JSON-RPC version: {0}")]
    InvalidVersion(String),

    #[error("Response id is not a request identifier: {0}")]
    InvalidId(Value),

    /// The frame correlates to a request but carries neither result nor error.
    #[error("Response {0} has neither result nor error")]
    MissingOutcome(RequestId),

    /// A server notification that is not tied to a subscription.
    #[error("Notification {0} carries no subscription")]
    NotASubscription(String),

    #[error("Frame is neither a response nor a notification")]
    Unrecognized,
}

/// Response to a call or subscribe request
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

/// Push delivered for an acknowledged subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionPush {
    pub method: String,
    pub subscription: RemoteId,
    pub payload: Result<Value, RpcError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(ResponseFrame),
    Notification(SubscriptionPush),
}

/// Distinguishes `"result": null` (present, null) from a missing field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RawPushParams {
    subscription: Value,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

pub fn parse_frame(text: &str) -> Result<Inbound, ProtocolError> {
    let raw: RawMessage = serde_json::from_str(text.trim())?;

    if let Some(version) = raw.jsonrpc.as_deref() {
        if version != JSONRPC_VERSION {
            return Err(ProtocolError::InvalidVersion(version.to_string()));
        }
    }

    match raw.id {
        Some(Value::Null) | None => {}
        Some(id_value) => {
            let id = id_value
                .as_u64()
                .and_then(|n| RequestId::try_from(n).ok())
                .ok_or_else(|| ProtocolError::InvalidId(id_value.clone()))?;

            let outcome = match (raw.error, raw.result) {
                (Some(error), _) => Err(error),
                (None, Some(result)) => Ok(result),
                (None, None) => return Err(ProtocolError::MissingOutcome(id)),
            };
            return Ok(Inbound::Response(ResponseFrame { id, outcome }));
        }
    }

    let Some(method) = raw.method else {
        return Err(ProtocolError::Unrecognized);
    };

    let params: RawPushParams = match raw.params {
        Some(params) => serde_json::from_value(params)
            .map_err(|_| ProtocolError::NotASubscription(method.clone()))?,
        None => return Err(ProtocolError::NotASubscription(method)),
    };

    let subscription = RemoteId::from_value(&params.subscription)
        .ok_or_else(|| ProtocolError::NotASubscription(method.clone()))?;

    let payload = match (params.error, params.result) {
        (Some(error), _) => Err(error),
        (None, Some(result)) => Ok(result),
        (None, None) => return Err(ProtocolError::NotASubscription(method)),
    };

    Ok(Inbound::Notification(SubscriptionPush {
        method,
        subscription,
        payload,
    }))
}
