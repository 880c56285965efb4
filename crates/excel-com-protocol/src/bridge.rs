//! Protocol between the native client and the bridge process that owns the
//! Excel COM object graph.
//!
//! The bridge reads [`Request`]s from stdin and writes [`Response`]s to
//! stdout, one JSON object per line. Diagnostics go to stderr, never stdout.

use serde::{Deserialize, Serialize};

use crate::{ObjectId, Variant};

/// A command sent from the client to the bridge process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Monotonically increasing request ID for correlating responses.
    pub id: u64,
    /// The command to execute.
    #[serde(flatten)]
    pub command: Command,
}

/// Commands the client can send to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum Command {
    /// Initialize COM, create the `Excel.Application` instance and open (or
    /// create) the workbook. Returns the workbook as the root object.
    Init {
        /// Windows path of the workbook; `None` creates a new one.
        path: Option<String>,
        visible: bool,
    },

    /// Read a property, optionally indexed (`Worksheets("Data")`).
    GetProperty {
        target: ObjectId,
        name: String,
        #[serde(default)]
        args: Vec<Variant>,
    },

    /// Write a property.
    SetProperty {
        target: ObjectId,
        name: String,
        value: Variant,
    },

    /// Invoke a method. Arguments are in natural order.
    Invoke {
        target: ObjectId,
        name: String,
        #[serde(default)]
        args: Vec<Variant>,
    },

    /// Drop the bridge's reference to an object.
    Release { handle: ObjectId },

    /// Round-trip through the Excel message loop to prove it is responsive.
    Ping,

    /// Save the root workbook, to `path` when given (Windows path).
    Save { path: Option<String> },

    /// Toggle the application window.
    SetVisible { visible: bool },

    /// Close the workbook, quit Excel, uninitialize COM and exit.
    Shutdown,
}

impl Command {
    /// Short name used in log lines and error context.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "Init",
            Command::GetProperty { .. } => "GetProperty",
            Command::SetProperty { .. } => "SetProperty",
            Command::Invoke { .. } => "Invoke",
            Command::Release { .. } => "Release",
            Command::Ping => "Ping",
            Command::Save { .. } => "Save",
            Command::SetVisible { .. } => "SetVisible",
            Command::Shutdown => "Shutdown",
        }
    }
}

/// A response sent from the bridge back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The request ID this response corresponds to.
    pub id: u64,
    /// The result of the command.
    #[serde(flatten)]
    pub result: ResponseResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ResponseResult {
    #[serde(rename = "ok")]
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Variant>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        /// Raw HRESULT of the failing COM call, when there was one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hresult: Option<i32>,
    },
}

impl Response {
    pub fn ok(id: u64, data: Option<Variant>) -> Self {
        Self {
            id,
            result: ResponseResult::Ok { data },
        }
    }

    pub fn error(id: u64, message: impl Into<String>, hresult: Option<i32>) -> Self {
        Self {
            id,
            result: ResponseResult::Error {
                message: message.into(),
                hresult,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn invoke_request_shape() {
        let request = Request {
            id: 3,
            command: Command::Invoke {
                target: ObjectId(12),
                name: "Item".to_string(),
                args: vec![Variant::from("Sales")],
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "id": 3,
                "cmd": "Invoke",
                "params": {"target": 12, "name": "Item", "args": ["Sales"]}
            })
        );
    }

    #[test]
    fn unit_commands_have_no_params() {
        let request = Request {
            id: 1,
            command: Command::Ping,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"id": 1, "cmd": "Ping"})
        );
    }

    #[test]
    fn error_response_carries_hresult() {
        let line = r#"{"id":9,"status":"error","message":"Call was rejected by callee.","hresult":-2147418111}"#;
        let response: Response = serde_json::from_str(line).unwrap();
        assert_eq!(response.id, 9);
        match response.result {
            ResponseResult::Error { hresult, .. } => {
                assert_eq!(hresult.map(|h| h as u32), Some(0x8001_0001))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn ok_response_without_data() {
        let response: Response = serde_json::from_str(r#"{"id":2,"status":"ok"}"#).unwrap();
        assert!(matches!(response.result, ResponseResult::Ok { data: None }));
    }
}
