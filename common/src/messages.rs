// common/src/messages.rs
//! Frames exchanged between the browser, the gateway and the backend.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One discrete message unit relayed over a WebSocket leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Orderly close initiated by the peer.
    Close,
}

/// A request frame: `{"RequestId", "Type", "Request", "Params"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "RequestId")]
    pub request_id: u64,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Request")]
    pub request: String,
    #[serde(rename = "Params", default)]
    pub params: Map<String, Value>,
}

impl RequestFrame {
    pub fn new(request_id: u64, kind: &str, request: &str, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            request_id,
            kind: kind.to_string(),
            request: request.to_string(),
            params,
        }
    }

    /// Parse a text frame, returning None for anything that is not a request.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn is(&self, kind: &str, request: &str) -> bool {
        self.kind == kind && self.request == request
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A response frame: `{"RequestId", "Response", "Error"?, "ErrorCode"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "RequestId")]
    pub request_id: u64,
    #[serde(rename = "Response", default)]
    pub response: Map<String, Value>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "ErrorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ResponseFrame {
    pub fn ok(request_id: u64, response: Value) -> Self {
        let response = match response {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            request_id,
            response,
            error: None,
            error_code: None,
        }
    }

    pub fn error(request_id: u64, message: impl Into<String>, code: Option<&str>) -> Self {
        Self {
            request_id,
            response: Map::new(),
            error: Some(message.into()),
            error_code: code.map(str::to_string),
        }
    }

    /// Parse a text frame, returning None for anything that is not a response.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        // Requests also carry a RequestId; tell them apart by the Type key.
        if value.get("Type").is_some() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub fn is_error(&self) -> bool {
        self.error.as_deref().map_or(false, |e| !e.is_empty())
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
