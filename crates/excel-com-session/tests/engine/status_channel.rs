//! The status channel over a real Unix socket.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use excel_com_session::status::{StatusClient, StatusError, StatusServer};
use excel_com_session::{SessionManager, SessionRequest, StatusConfig, Variant};
use excel_com_protocol::status::StatusResponse;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{engine, fast_config, PATIENCE};

struct Channel {
    client: StatusClient,
    stop: oneshot::Sender<()>,
    server: JoinHandle<io::Result<()>>,
    dir: TempDir,
}

impl Channel {
    async fn start(manager: &Arc<SessionManager>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("xlhost").join("status.sock");
        let server = StatusServer::bind(
            Arc::clone(manager),
            StatusConfig {
                endpoint: Some(endpoint.clone()),
                ..StatusConfig::default()
            },
        )
        .unwrap();
        let (stop, stopped) = oneshot::channel();
        let server = tokio::spawn(server.serve_until(async {
            let _ = stopped.await;
        }));
        Self {
            client: StatusClient::new(endpoint).with_timeout(PATIENCE),
            stop,
            server,
            dir,
        }
    }

    async fn shut_down(self) {
        let endpoint = self.client.endpoint().to_path_buf();
        let _ = self.stop.send(());
        self.server.await.unwrap().unwrap();
        assert!(!endpoint.exists(), "socket left behind");
        drop(self.dir);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_list_answers_while_a_long_batch_runs() {
    let (launcher, manager) = engine(fast_config());
    let busy = manager
        .open(SessionRequest::new("/books/busy.xlsx").with_id("busy"))
        .unwrap();
    manager
        .open(SessionRequest::new("/books/idle.xlsx").with_id("idle").visible(true))
        .unwrap();
    let host = launcher.host_for("/books/busy.xlsx").unwrap();
    host.hang_on("Item");

    let worker = {
        let manager = Arc::clone(&manager);
        let busy = Arc::clone(&busy);
        std::thread::spawn(move || {
            manager
                .executor()
                .execute_once(&busy, Duration::from_secs(120), |ctx| {
                    let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
                    let sheet = ctx.scope().item(&sheets, "Sheet1")?;
                    sheet.get("Name")
                })
        })
    };
    assert!(host.wait_for_hung_call(PATIENCE));

    let channel = Channel::start(&manager).await;
    let started = Instant::now();
    let list = channel.client.list().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "list took {:?}",
        started.elapsed()
    );

    assert_eq!(list.count, 2);
    let busy_status = list.sessions.iter().find(|s| s.session_id == "busy").unwrap();
    assert_eq!(busy_status.active_operations, 1);
    assert!(!busy_status.can_close);
    assert!(!busy_status.is_visible);
    let idle_status = list.sessions.iter().find(|s| s.session_id == "idle").unwrap();
    assert_eq!(idle_status.active_operations, 0);
    assert!(idle_status.can_close);
    assert!(idle_status.is_visible);
    assert_eq!(idle_status.file_path, "/books/idle.xlsx");

    let refused = channel.client.close("busy", false).await.unwrap();
    assert!(!refused.success);
    assert!(
        refused.error_message.as_deref().unwrap_or_default().contains("active operation"),
        "unexpected message: {:?}",
        refused.error_message
    );

    let closed = channel.client.close("idle", true).await.unwrap();
    assert!(closed.success, "close failed: {:?}", closed.error_message);
    assert!(closed.saved);
    assert_eq!(closed.error_message, None);
    let idle_host = launcher.host_for("/books/idle.xlsx").unwrap();
    assert_eq!(idle_host.saves(), vec![None]);
    assert!(idle_host.has_quit());

    host.release_hangs();
    let name = tokio::task::spawn_blocking(move || worker.join().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, Variant::from("Sheet1"));

    let list = channel.client.list().await.unwrap();
    assert_eq!(list.count, 1);
    assert!(list.sessions[0].can_close);

    channel.shut_down().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_requests_get_structured_errors() {
    let (_launcher, manager) = engine(fast_config());
    let channel = Channel::start(&manager).await;

    match channel.client.send_line(r#"{"action":"reboot"}"#).await.unwrap() {
        StatusResponse::Error(e) => {
            assert!(!e.success);
            assert!(e.is_error);
            assert_eq!(e.error_message, "Unknown action: 'reboot'");
        }
        other => panic!("expected an error response, got {other:?}"),
    }

    match channel.client.send_line("{not json").await.unwrap() {
        StatusResponse::Error(e) => assert!(
            e.error_message.starts_with("Invalid JSON request"),
            "got {:?}",
            e.error_message
        ),
        other => panic!("expected an error response, got {other:?}"),
    }

    let unknown = channel.client.close("ghost", false).await.unwrap();
    assert!(!unknown.success);
    assert_eq!(
        unknown.error_message.as_deref(),
        Some("Session 'ghost' not found")
    );

    let list = channel.client.list().await.unwrap();
    assert_eq!(list.count, 0);
    assert!(list.sessions.is_empty());

    channel.shut_down().await;
}

#[tokio::test]
async fn test_socket_is_private_to_its_owner() {
    let (_launcher, manager) = engine(fast_config());
    let channel = Channel::start(&manager).await;

    let endpoint = channel.client.endpoint().to_path_buf();
    let socket_mode = std::fs::metadata(&endpoint).unwrap().permissions().mode();
    assert_eq!(socket_mode & 0o777, 0o600);
    let dir_mode = std::fs::metadata(endpoint.parent().unwrap())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(dir_mode & 0o777, 0o700);

    channel.shut_down().await;
}

#[tokio::test]
async fn test_client_reports_when_nothing_is_listening() {
    let dir = tempfile::tempdir().unwrap();
    let client = StatusClient::new(dir.path().join("status.sock"));
    let err = client.list().await.unwrap_err();
    assert!(matches!(err, StatusError::NotRunning(_)), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_request_ends_serving() {
    let (_launcher, manager) = engine(fast_config());
    let channel = Channel::start(&manager).await;
    let endpoint = channel.client.endpoint().to_path_buf();

    let stop = channel.client.stop().await.unwrap();
    assert!(stop.success);
    assert!(stop.stopping);

    tokio::time::timeout(PATIENCE, channel.server)
        .await
        .expect("server kept serving after stop")
        .unwrap()
        .unwrap();
    assert!(!endpoint.exists(), "socket left behind");
    let err = channel.client.list().await.unwrap_err();
    assert!(matches!(err, StatusError::NotRunning(_)), "got {err:?}");
}
