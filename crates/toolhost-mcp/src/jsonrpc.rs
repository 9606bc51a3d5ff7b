//! JSON-RPC 2.0 framing for MCP over stdio.
//!
//! Every frame is one line of JSON. Incoming lines are classified by which
//! fields are present rather than by a type tag: `id` + `method` is a request,
//! `id` alone is a response, `method` alone is a notification.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// A request id as it appears on the wire.
///
/// Servers are free to echo an integer id back as `3.0`, so ids coming off
/// the wire always go through [`RequestId::from_value`], which folds integral
/// floats into `Number`. Ids are compared only in this normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Normalize a raw JSON id. Returns `None` for ids that cannot name a
    /// request we sent (null, objects, fractional numbers, out-of-range).
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Some(Self::Number(i));
                }
                if n.is_u64() {
                    return None;
                }
                let f = n.as_f64()?;
                if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
                {
                    Some(Self::Number(f as i64))
                } else {
                    None
                }
            }
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "\"{s}\""),
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A JSON-RPC 2.0 error object. Only `message` is required of servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Decode one line of input into exactly one [`Message`].
pub fn decode_line(line: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(line.trim())?;
    let Value::Object(mut frame) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let id = match frame.remove("id") {
        Some(raw) => Some(RequestId::from_value(&raw).ok_or(DecodeError::InvalidId(raw))?),
        None => None,
    };
    let method = match frame.remove("method") {
        Some(Value::String(method)) => Some(method),
        Some(_) => return Err(DecodeError::InvalidMethod),
        None => None,
    };
    let params = frame.remove("params");

    match (id, method) {
        (Some(id), Some(method)) => Ok(Message::Request(JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        })),
        (Some(id), None) => {
            let error = frame
                .remove("error")
                .filter(|e| !e.is_null())
                .map(serde_json::from_value::<JsonRpcError>)
                .transpose()
                .map_err(DecodeError::InvalidErrorObject)?;
            Ok(Message::Response(JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION,
                id,
                result: frame.remove("result"),
                error,
            }))
        }
        (None, Some(method)) => Ok(Message::Notification(JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        })),
        (None, None) => Err(DecodeError::Unclassifiable),
    }
}

/// Serialize an outgoing frame. The writer appends the newline.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}
