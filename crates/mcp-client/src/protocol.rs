//! JSON-RPC 2.0 wire codec
//!
//! Serializes and parses the three JSON-RPC message shapes used by MCP and
//! allocates request identifiers.

use crate::Result;
use crate::error::MCPError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// JSON-RPC protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next request id
///
/// Ids are strictly increasing for the lifetime of the process and never
/// reused.
pub fn next_id() -> RequestId {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    RequestId::Number(i64::try_from(id).unwrap_or(i64::MAX))
}

/// Request identifier, either an integer or a string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no response expected)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(error_codes::PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(error_codes::INVALID_REQUEST, "Invalid Request")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

/// JSON-RPC 2.0 response
///
/// Exactly one of `result` and `error` is set; the constructors and the
/// parser uphold this.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Convert into the request outcome seen by the caller
    pub fn into_result(self) -> Result<Value> {
        match (self.error, self.result) {
            (Some(error), _) => Err(MCPError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }
}

/// Any JSON-RPC message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notification)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}

/// Serialize a message to its JSON bytes (no trailing newline)
pub fn serialize(message: &JsonRpcMessage) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Serialize a message to a JSON string (no trailing newline)
pub fn serialize_to_string(message: &JsonRpcMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse one JSON-RPC message
pub fn parse(bytes: &[u8]) -> Result<JsonRpcMessage> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| MCPError::Parse(format!("malformed JSON: {e}")))?;
    parse_value(value)
}

/// Parse one JSON-RPC message from an already-decoded JSON value
pub fn parse_value(value: Value) -> Result<JsonRpcMessage> {
    let Value::Object(mut obj) = value else {
        return Err(MCPError::Parse("message is not a JSON object".to_string()));
    };

    let jsonrpc = match obj.remove("jsonrpc") {
        None => JSONRPC_VERSION.to_string(),
        Some(Value::String(v)) if v == JSONRPC_VERSION => v,
        Some(other) => {
            return Err(MCPError::Parse(format!(
                "unsupported jsonrpc version: {other}"
            )));
        }
    };

    let id = obj.remove("id").map(parse_id).transpose()?;

    match obj.remove("method") {
        Some(Value::String(method)) => {
            let params = obj.remove("params");
            Ok(match id {
                Some(Some(id)) => JsonRpcMessage::Request(JsonRpcRequest {
                    jsonrpc,
                    id,
                    method,
                    params,
                }),
                Some(None) => {
                    return Err(MCPError::Parse(
                        "request id must not be null".to_string(),
                    ));
                }
                None => JsonRpcMessage::Notification(JsonRpcNotification {
                    jsonrpc,
                    method,
                    params,
                }),
            })
        }
        Some(_) => Err(MCPError::Parse("method must be a string".to_string())),
        None => parse_response(jsonrpc, id, obj),
    }
}

fn parse_response(
    jsonrpc: String,
    id: Option<Option<RequestId>>,
    mut obj: Map<String, Value>,
) -> Result<JsonRpcMessage> {
    let result = obj.remove("result");
    let error = obj
        .remove("error")
        .map(serde_json::from_value::<JsonRpcError>)
        .transpose()
        .map_err(|e| MCPError::Parse(format!("invalid error object: {e}")))?;

    match (&result, &error) {
        (None, None) => Err(MCPError::Parse(
            "payload is not a request, notification, or response".to_string(),
        )),
        (Some(_), Some(_)) => Err(MCPError::Parse(
            "response carries both result and error".to_string(),
        )),
        _ => Ok(JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc,
            id: id.flatten(),
            result,
            error,
        })),
    }
}

fn parse_id(value: Value) -> Result<Option<RequestId>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(RequestId::String(s))),
        Value::Number(n) => n
            .as_i64()
            .map(|n| Some(RequestId::Number(n)))
            .ok_or_else(|| MCPError::Parse(format!("id must be an integer: {n}"))),
        other => Err(MCPError::Parse(format!("invalid id: {other}"))),
    }
}
