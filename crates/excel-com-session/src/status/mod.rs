//! Out-of-process status and control channel.
//!
//! A local endpoint, reachable only by the user running the engine, that
//! answers one newline-delimited JSON request per connection. `list` reads
//! session snapshots without touching any execution lock, so a monitor gets
//! an answer even while every session is busy. `close` runs on the blocking
//! pool so the accept loop never waits on a host. `stop` ends
//! [`StatusServer::serve_until`] once its response has been written.

use std::path::PathBuf;
use std::sync::Arc;

use excel_com_protocol::status::{
    CloseResponse, ErrorResponse, ListResponse, SessionStatus, StatusRequest, StatusResponse,
    StopResponse,
};
use tracing::{debug, info};

use crate::manager::SessionManager;
use crate::session::SessionInfo;

mod client;
mod server;

pub use client::{StatusClient, StatusError};
pub use server::StatusServer;

const ENDPOINT_DIR: &str = "xlhost";
#[cfg(unix)]
const SOCKET_NAME: &str = "status.sock";

/// Per-user default endpoint.
///
/// On Unix: `$XDG_RUNTIME_DIR/xlhost/status.sock`, falling back to
/// `/tmp/xlhost-$USER/status.sock`. On Windows: `\\.\pipe\xlhost-status-%USERNAME%`.
#[cfg(unix)]
pub fn default_endpoint() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime_dir) => PathBuf::from(runtime_dir).join(ENDPOINT_DIR).join(SOCKET_NAME),
        None => {
            let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
            PathBuf::from("/tmp")
                .join(format!("{ENDPOINT_DIR}-{user}"))
                .join(SOCKET_NAME)
        }
    }
}

#[cfg(windows)]
pub fn default_endpoint() -> PathBuf {
    let user = std::env::var("USERNAME").unwrap_or_else(|_| "default".to_string());
    PathBuf::from(format!(r"\\.\pipe\{ENDPOINT_DIR}-status-{user}"))
}

impl From<&SessionInfo> for SessionStatus {
    fn from(info: &SessionInfo) -> Self {
        SessionStatus {
            session_id: info.id.to_string(),
            file_path: info.file.display().to_string(),
            active_operations: info.active_operations,
            is_visible: info.visible,
            can_close: info.can_close(),
        }
    }
}

/// Answer one request line.
pub async fn respond(manager: &Arc<SessionManager>, line: &str) -> StatusResponse {
    let request = match StatusRequest::parse(line) {
        Ok(request) => request,
        Err(message) => {
            debug!(%message, "rejected status request");
            return ErrorResponse::new(message).into();
        }
    };

    match request {
        StatusRequest::List => {
            let sessions = manager.list_active().iter().map(SessionStatus::from).collect();
            ListResponse::new(sessions).into()
        }
        StatusRequest::Close { session_id, save } => {
            let closer = Arc::clone(manager);
            let id = session_id.clone();
            let closed = tokio::task::spawn_blocking(move || closer.close(&id, save)).await;
            let failed = |message: String| CloseResponse {
                success: false,
                session_id: session_id.clone(),
                saved: false,
                error_message: Some(message),
            };
            match closed {
                Ok(Ok(true)) => CloseResponse {
                    success: true,
                    session_id: session_id.clone(),
                    saved: save,
                    error_message: None,
                }
                .into(),
                Ok(Ok(false)) => failed(format!("Session '{session_id}' not found")).into(),
                Ok(Err(e)) => failed(e.to_string()).into(),
                Err(e) => ErrorResponse::new(format!("Close of '{session_id}' failed: {e}")).into(),
            }
        }
        StatusRequest::Stop => {
            info!("stop requested over the status channel");
            StopResponse::accepted().into()
        }
    }
}
