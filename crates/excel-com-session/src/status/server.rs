use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use excel_com_protocol::status::{ErrorResponse, StatusResponse};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{default_endpoint, respond};
use crate::config::StatusConfig;
use crate::manager::SessionManager;

#[cfg(unix)]
const DIRECTORY_MODE: u32 = 0o700;
#[cfg(unix)]
const SOCKET_MODE: u32 = 0o600;

/// Serves the status channel for one [`SessionManager`].
///
/// Must be bound from inside a tokio runtime.
pub struct StatusServer {
    manager: Arc<SessionManager>,
    config: StatusConfig,
    endpoint: PathBuf,
    stop: Arc<Notify>,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(unix)]
    owner_uid: u32,
    #[cfg(windows)]
    first_pipe: tokio::net::windows::named_pipe::NamedPipeServer,
}

impl StatusServer {
    #[cfg(unix)]
    pub fn bind(manager: Arc<SessionManager>, config: StatusConfig) -> io::Result<Self> {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let endpoint = config.endpoint.clone().unwrap_or_else(default_endpoint);
        if let Some(dir) = endpoint.parent() {
            ensure_private_dir(dir)?;
        }
        remove_stale_socket(&endpoint)?;

        let listener = tokio::net::UnixListener::bind(&endpoint).map_err(|e| {
            io::Error::new(e.kind(), format!("failed to bind {}: {e}", endpoint.display()))
        })?;
        std::fs::set_permissions(&endpoint, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        let owner_uid = std::fs::metadata(&endpoint)?.uid();

        info!(endpoint = %endpoint.display(), "status channel listening");
        Ok(Self {
            manager,
            config,
            endpoint,
            stop: Arc::new(Notify::new()),
            listener,
            owner_uid,
        })
    }

    #[cfg(windows)]
    pub fn bind(manager: Arc<SessionManager>, config: StatusConfig) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let endpoint = config.endpoint.clone().unwrap_or_else(default_endpoint);
        let first_pipe = ServerOptions::new()
            .first_pipe_instance(true)
            .reject_remote_clients(true)
            .create(&endpoint)?;
        info!(endpoint = %endpoint.display(), "status channel listening");
        Ok(Self {
            manager,
            config,
            endpoint,
            stop: Arc::new(Notify::new()),
            first_pipe,
        })
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Serve until the process exits.
    pub async fn serve(self) -> io::Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes or a client asks to stop, then remove
    /// the endpoint.
    #[cfg(unix)]
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        tokio::pin!(shutdown);
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = self.stop.notified() => break Ok(()),
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => break Err(e),
                    };
                    match stream.peer_cred() {
                        Ok(cred) if cred.uid() == self.owner_uid => {}
                        Ok(cred) => {
                            warn!(peer_uid = cred.uid(), "rejected status connection from another user");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "could not read peer credentials; dropping connection");
                            continue;
                        }
                    }
                    self.spawn_connection(stream);
                }
            }
        };
        if let Err(e) = std::fs::remove_file(&self.endpoint) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove status socket");
            }
        }
        info!("status channel stopped");
        result
    }

    #[cfg(windows)]
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;

        tokio::pin!(shutdown);
        let Self {
            manager,
            config,
            endpoint,
            stop,
            first_pipe,
        } = self;
        let mut pipe = first_pipe;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = stop.notified() => break,
                connected = pipe.connect() => {
                    connected?;
                    let next = ServerOptions::new().reject_remote_clients(true).create(&endpoint)?;
                    let client = std::mem::replace(&mut pipe, next);
                    tokio::spawn(serve_connection(
                        client,
                        Arc::clone(&manager),
                        config.clone(),
                        Arc::clone(&stop),
                    ));
                }
            }
        }
        info!("status channel stopped");
        Ok(())
    }

    #[cfg(unix)]
    fn spawn_connection(&self, stream: tokio::net::UnixStream) {
        tokio::spawn(serve_connection(
            stream,
            Arc::clone(&self.manager),
            self.config.clone(),
            Arc::clone(&self.stop),
        ));
    }
}

/// One request, one response, then close.
async fn serve_connection<S>(stream: S, manager: Arc<SessionManager>, config: StatusConfig, stop: Arc<Notify>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let response = match read_request(reader, &config).await {
        Ok(line) => respond(&manager, &line).await,
        Err(message) => ErrorResponse::new(message).into(),
    };
    if let Err(e) = write_response(&mut writer, &response).await {
        debug!(error = %e, "status client went away before the response");
    }
    if matches!(response, StatusResponse::Stop(_)) {
        stop.notify_one();
    }
}

async fn read_request<R>(reader: R, config: &StatusConfig) -> Result<String, String>
where
    R: AsyncRead + Unpin,
{
    let limit = config.max_request_bytes;
    let mut reader = BufReader::new(reader.take(limit as u64 + 1));
    let mut line = String::new();
    let read = tokio::time::timeout(config.read_timeout, reader.read_line(&mut line)).await;
    match read {
        Err(_) => return Err(format!("Timed out waiting for request after {:?}", config.read_timeout)),
        Ok(Err(e)) => return Err(format!("Failed to read request: {e}")),
        Ok(Ok(_)) => {}
    }
    if line.len() > limit && !line.ends_with('\n') {
        return Err(format!("Request exceeds {limit} bytes"));
    }
    let line = line.trim();
    if line.is_empty() {
        return Err("Empty request".to_string());
    }
    Ok(line.to_string())
}

async fn write_response<W>(writer: &mut W, response: &StatusResponse) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(response).map_err(io::Error::other)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    writer.shutdown().await
}

/// Create `dir` with mode 0700, or verify an existing one is a real directory
/// with no group or other permissions.
#[cfg(unix)]
fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    match std::fs::symlink_metadata(dir) {
        Ok(meta) => {
            if meta.file_type().is_symlink() || !meta.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a directory", dir.display()),
                ));
            }
            if meta.mode() & 0o077 != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!(
                        "{} is accessible by other users (mode {:o})",
                        dir.display(),
                        meta.mode() & 0o777
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(dir)?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIRECTORY_MODE))
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            debug!(path = %path.display(), "removed stale status socket");
            Ok(())
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn private_dir_is_created_0700() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("xlhost");
        ensure_private_dir(&dir).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn shared_dir_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(
            ensure_private_dir(tmp.path()).unwrap_err().kind(),
            io::ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn non_socket_files_are_not_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.sock");
        std::fs::write(&path, b"not a socket").unwrap();
        assert!(remove_stale_socket(&path).is_err());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected() {
        let config = StatusConfig {
            max_request_bytes: 16,
            ..StatusConfig::default()
        };
        let input: &[u8] = b"{\"action\":\"list\",\"padding\":\"xxxxxxxx\"}\n";
        let err = read_request(input, &config).await.unwrap_err();
        assert_eq!(err, "Request exceeds 16 bytes");
    }

    #[tokio::test]
    async fn silent_clients_time_out() {
        let config = StatusConfig {
            read_timeout: std::time::Duration::from_millis(20),
            ..StatusConfig::default()
        };
        let (_client, server) = tokio::io::duplex(64);
        let err = read_request(server, &config).await.unwrap_err();
        assert!(err.starts_with("Timed out waiting for request"));
    }
}
