//! JSON-RPC 2.0 envelope types for agent traffic.
//!
//! All agent-to-server traffic is JSON-RPC 2.0. The envelope is modeled as a
//! fixed struct with `params` kept opaque (`serde_json::Value`) so that
//! tool-call decomposition happens only where deep inspection is required.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Protocol version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// Malformed envelope.
pub const CODE_PARSE_ERROR: i32 = -32700;
/// Request rejected by the firewall policy.
pub const CODE_BLOCKED: i32 = -32001;
/// Upstream forwarding failure.
pub const CODE_UPSTREAM_ERROR: i32 = -32603;

/// A JSON-RPC request id: string or integer. Notifications carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

/// Inbound JSON-RPC 2.0 request from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl JsonRpcRequest {
    /// Parse and validate an envelope from raw bytes.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(raw)?;
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(Error::Internal(format!(
                "unsupported jsonrpc version: {:?}",
                request.jsonrpc
            )));
        }
        if request.method.is_empty() {
            return Err(Error::Internal("missing method".to_string()));
        }
        Ok(request)
    }

    /// Placeholder request for payloads that failed to parse.
    pub fn invalid() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: "<parse_error>".to_string(),
            params: None,
            id: None,
        }
    }

    /// Notifications have no id and expect no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Standard JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Outbound JSON-RPC 2.0 response to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn result(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Build an error response.
    pub fn error(
        id: Option<RequestId>,
        code: i32,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    /// Serialize to bytes for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| b"{}".to_vec())
    }
}

/// Parsed representation of a `tools/call` invocation, decomposed from the
/// opaque params for deep inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
}

impl ToolCall {
    /// Extract tool-call info from raw params. Returns `None` when the
    /// params don't carry a tool name (handshake and discovery requests).
    pub fn from_params(params: Option<&Value>) -> Option<Self> {
        let obj = params?.as_object()?;
        let name = obj.get("name")?.as_str()?.to_string();
        let arguments = obj
            .get("arguments")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        Some(Self { name, arguments })
    }
}
