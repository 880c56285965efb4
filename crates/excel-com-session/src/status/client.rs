use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use excel_com_protocol::status::{
    CloseResponse, ListResponse, StatusRequest, StatusResponse, StopResponse,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::default_endpoint;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("no engine is listening on {0}")]
    NotRunning(PathBuf),

    #[error("status channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("invalid status response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("status request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("engine reported an error: {0}")]
    Server(String),

    #[error("unexpected response shape for '{0}'")]
    UnexpectedResponse(&'static str),
}

/// Talks to a running engine's status channel.
#[derive(Debug, Clone)]
pub struct StatusClient {
    endpoint: PathBuf,
    timeout: Duration,
}

impl StatusClient {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub async fn list(&self) -> Result<ListResponse, StatusError> {
        match self.request(&StatusRequest::List).await? {
            StatusResponse::List(list) => Ok(list),
            StatusResponse::Error(e) => Err(StatusError::Server(e.error_message)),
            _ => Err(StatusError::UnexpectedResponse("list")),
        }
    }

    /// Close a session. A refused close comes back as a `CloseResponse`
    /// with `success: false`, not as an `Err`.
    pub async fn close(&self, session_id: &str, save: bool) -> Result<CloseResponse, StatusError> {
        let request = StatusRequest::Close {
            session_id: session_id.to_string(),
            save,
        };
        match self.request(&request).await? {
            StatusResponse::Close(close) => Ok(close),
            StatusResponse::Error(e) => Err(StatusError::Server(e.error_message)),
            _ => Err(StatusError::UnexpectedResponse("close")),
        }
    }

    /// Ask the engine to stop serving and shut its sessions down.
    pub async fn stop(&self) -> Result<StopResponse, StatusError> {
        match self.request(&StatusRequest::Stop).await? {
            StatusResponse::Stop(stop) => Ok(stop),
            StatusResponse::Error(e) => Err(StatusError::Server(e.error_message)),
            _ => Err(StatusError::UnexpectedResponse("stop")),
        }
    }

    pub async fn request(&self, request: &StatusRequest) -> Result<StatusResponse, StatusError> {
        self.send_line(&serde_json::to_string(request)?).await
    }

    /// Send a raw request line, including ones the typed requests cannot
    /// express.
    pub async fn send_line(&self, line: &str) -> Result<StatusResponse, StatusError> {
        let attempt = async {
            let stream = match connect(&self.endpoint).await {
                Ok(stream) => stream,
                Err(e) if is_not_running(&e) => {
                    return Err(StatusError::NotRunning(self.endpoint.clone()))
                }
                Err(e) => return Err(e.into()),
            };
            exchange(stream, line).await
        };
        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| StatusError::TimedOut(self.timeout))?
    }
}

impl Default for StatusClient {
    fn default() -> Self {
        Self::new(default_endpoint())
    }
}

#[cfg(unix)]
async fn connect(endpoint: &Path) -> io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(endpoint).await
}

#[cfg(windows)]
async fn connect(
    endpoint: &Path,
) -> io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)
}

fn is_not_running(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

async fn exchange<S>(mut stream: S, line: &str) -> Result<StatusResponse, StatusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(line.trim_end().as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await?;
    if response.is_empty() {
        return Err(StatusError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection without responding",
        )));
    }
    Ok(serde_json::from_str(&response)?)
}
