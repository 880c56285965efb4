//! Status channel protocol.
//!
//! A client connects, writes one [`StatusRequest`] line, reads one response
//! line and the server closes the connection. Responses are one of
//! [`ListResponse`], [`CloseResponse`], [`StopResponse`] or [`ErrorResponse`];
//! they share the `success` field so a monitor can branch before picking a
//! shape.

use serde::{Deserialize, Serialize};

/// A request to the status channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum StatusRequest {
    /// List active sessions. No side effects.
    List,
    /// Close one session, optionally saving its workbook first.
    Close {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default)]
        save: bool,
    },
    /// Stop serving and shut the engine down. The response is sent before
    /// the shutdown starts.
    Stop,
}

impl StatusRequest {
    /// Parse one request line. Unknown actions and malformed JSON come back
    /// as an error string suitable for an [`ErrorResponse`].
    pub fn parse(line: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| format!("Invalid JSON request: {e}"))?;

        match value.get("action").and_then(|a| a.as_str()) {
            None => Err("Request is missing the 'action' field".to_string()),
            Some("list") | Some("close") | Some("stop") => serde_json::from_value(value)
                .map_err(|e| format!("Invalid request parameters: {e}")),
            Some(other) => Err(format!("Unknown action: '{other}'")),
        }
    }
}

/// One session in a `list` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub file_path: String,
    pub active_operations: usize,
    pub is_visible: bool,
    pub can_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub success: bool,
    pub sessions: Vec<SessionStatus>,
    pub count: usize,
}

impl ListResponse {
    pub fn new(sessions: Vec<SessionStatus>) -> Self {
        Self {
            success: true,
            count: sessions.len(),
            sessions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseResponse {
    pub success: bool,
    pub session_id: String,
    pub saved: bool,
    /// Always serialized; `null` on success.
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error_message: String,
    pub is_error: bool,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: message.into(),
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub success: bool,
    pub stopping: bool,
}

impl StopResponse {
    pub fn accepted() -> Self {
        Self {
            success: true,
            stopping: true,
        }
    }
}

/// Any response the status channel can send.
///
/// Variants are tried in order, so the shapes with the most required fields
/// come first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusResponse {
    List(ListResponse),
    Close(CloseResponse),
    Error(ErrorResponse),
    Stop(StopResponse),
}

impl StatusResponse {
    pub fn is_success(&self) -> bool {
        match self {
            StatusResponse::List(r) => r.success,
            StatusResponse::Close(r) => r.success,
            StatusResponse::Stop(r) => r.success,
            StatusResponse::Error(_) => false,
        }
    }
}

impl From<ListResponse> for StatusResponse {
    fn from(r: ListResponse) -> Self {
        StatusResponse::List(r)
    }
}

impl From<CloseResponse> for StatusResponse {
    fn from(r: CloseResponse) -> Self {
        StatusResponse::Close(r)
    }
}

impl From<StopResponse> for StatusResponse {
    fn from(r: StopResponse) -> Self {
        StatusResponse::Stop(r)
    }
}

impl From<ErrorResponse> for StatusResponse {
    fn from(r: ErrorResponse) -> Self {
        StatusResponse::Error(r)
    }
}
