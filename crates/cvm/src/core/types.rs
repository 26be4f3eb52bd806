//! Core types for the ContextVM protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;

/// Encryption mode for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    /// Encrypt when the peer is known to accept it; accept both directions.
    Optional,
    /// Enforce encryption for all messages.
    Required,
    /// Disable encryption entirely.
    Disabled,
}

impl Default for EncryptionMode {
    fn default() -> Self {
        Self::Optional
    }
}

/// Human-facing server metadata published on announcements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub about: Option<String>,
    pub website: Option<String>,
    pub picture: Option<String>,
}

/// Price attached to a single capability (tool name, resource URI, prompt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityPrice {
    pub price: String,
    pub currency: String,
}

// ── JSON-RPC 2.0 message model ──

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// The `params._meta.progressToken` value, normalized to a string.
    pub fn progress_token(&self) -> Option<String> {
        self.params
            .as_ref()
            .and_then(|p| p.get("_meta"))
            .and_then(|m| m.get("progressToken"))
            .and_then(token_as_string)
    }
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// The `params.progressToken` value of a progress notification.
    pub fn progress_token(&self) -> Option<String> {
        self.params
            .as_ref()
            .and_then(|p| p.get("progressToken"))
            .and_then(token_as_string)
    }
}

impl JsonRpcResponse {
    pub fn result(id: impl Into<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// True when the result has the shape of an MCP `initialize` result.
    pub fn is_initialize_result(&self) -> bool {
        self.result
            .as_ref()
            .map(|r| r.get("protocolVersion").is_some() && r.get("capabilities").is_some())
            .unwrap_or(false)
    }
}

/// Progress tokens may be strings or integers on the wire.
fn token_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// An MCP message classified by its JSON-RPC shape.
///
/// `Invalid` is the decode sentinel: callers skip such messages instead of
/// failing the subscription that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum McpMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Invalid,
}

impl McpMessage {
    /// Classify a JSON value: `method` + `id` is a request, `method` alone a
    /// notification, `result`/`error` with `id` a response.
    pub fn from_value(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::Invalid;
        };
        if obj.contains_key("method") {
            if obj.contains_key("id") {
                match serde_json::from_value(value) {
                    Ok(request) => Self::Request(request),
                    Err(_) => Self::Invalid,
                }
            } else {
                match serde_json::from_value(value) {
                    Ok(notification) => Self::Notification(notification),
                    Err(_) => Self::Invalid,
                }
            }
        } else if obj.contains_key("result") || obj.contains_key("error") {
            match serde_json::from_value(value) {
                Ok(response) => Self::Response(response),
                Err(_) => Self::Invalid,
            }
        } else {
            Self::Invalid
        }
    }

    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str(json) {
            Ok(value) => Self::from_value(value),
            Err(_) => Self::Invalid,
        }
    }

    pub fn to_json(&self) -> crate::core::error::Result<String> {
        let json = match self {
            Self::Request(r) => serde_json::to_string(r)?,
            Self::Notification(n) => serde_json::to_string(n)?,
            Self::Response(r) => serde_json::to_string(r)?,
            Self::Invalid => {
                return Err(crate::core::error::Error::InvalidEvent(
                    "cannot serialize an invalid message".to_string(),
                ))
            }
        };
        Ok(json)
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

// ── Server-side session state ──

/// Per-remote-client state held by the server transport.
///
/// `pending` maps correlation keys to values two ways: an inbound event id
/// (hex) maps to the original JSON-RPC id the client used, and a progress
/// token maps to the event id of the request that supplied it.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_pubkey: String,
    pub is_initialized: bool,
    pub is_encrypted: bool,
    pub last_activity: Instant,
    pub pending: HashMap<String, Value>,
}

impl ClientSession {
    pub fn new(client_pubkey: String, is_encrypted: bool) -> Self {
        Self {
            client_pubkey,
            is_initialized: false,
            is_encrypted,
            last_activity: Instant::now(),
            pending: HashMap::new(),
        }
    }

    pub fn update_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn mark_initialized(&mut self) {
        self.is_initialized = true;
    }

    /// Record an inbound request: event id → the client's original JSON-RPC id.
    pub fn remember_request(&mut self, event_id: String, original_id: Value) {
        self.pending.insert(event_id, original_id);
    }

    /// Record a progress token supplied by a request: token → event id.
    pub fn remember_progress_token(&mut self, token: String, event_id: String) {
        self.pending.insert(token, Value::String(event_id));
    }

    /// The original JSON-RPC id for a pending event id, if tracked.
    pub fn original_id(&self, event_id: &str) -> Option<&Value> {
        self.pending.get(event_id)
    }

    /// The request event id a progress token was attached to, if tracked.
    pub fn event_id_for_token(&self, token: &str) -> Option<String> {
        self.pending
            .get(token)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Drop a completed request and any progress tokens that referenced it.
    pub fn clear_request(&mut self, event_id: &str) {
        self.pending.remove(event_id);
        self.pending
            .retain(|_, value| value.as_str() != Some(event_id));
    }
}
