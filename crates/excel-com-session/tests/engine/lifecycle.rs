//! Session creation, close policies and session-of-one.

use std::sync::{mpsc, Arc, Barrier};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use excel_com_session::testing::FakeHost;
use excel_com_session::{
    ClosePolicy, EngineConfig, EngineError, Result, Session, SessionManager, SessionState,
    Variant,
};
use pretty_assertions::assert_eq;

use crate::{engine, fast_config, wait_until, PATIENCE};

/// Start a batch that blocks inside the host until `host.release_hangs()`.
fn start_stuck_batch(
    manager: &Arc<SessionManager>,
    session: &Arc<Session>,
    host: &FakeHost,
) -> JoinHandle<Result<Variant>> {
    host.hang_on("Item");
    let manager = Arc::clone(manager);
    let session = Arc::clone(session);
    let worker = std::thread::spawn(move || {
        manager.executor().execute_once(&session, PATIENCE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            let sheet = ctx.scope().item(&sheets, "Sheet1")?;
            sheet.get("Name")
        })
    });
    assert!(host.wait_for_hung_call(PATIENCE), "batch never reached the host");
    worker
}

#[test]
fn test_concurrent_get_or_create_launches_one_host() {
    let (launcher, manager) = engine(fast_config());
    launcher.set_launch_delay(Duration::from_millis(100));
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                manager.get_or_create("/books/shared.xlsx").map(|s| s.id().clone())
            })
        })
        .collect();
    let ids: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().unwrap().unwrap())
        .collect();

    assert!(ids.iter().all(|id| *id == ids[0]), "ids differ: {ids:?}");
    assert_eq!(launcher.launches(), 1);
    assert_eq!(manager.list_active().len(), 1);
}

#[test]
fn test_different_files_get_different_sessions() {
    let (launcher, manager) = engine(fast_config());
    let a = manager.get_or_create("/books/a.xlsx").unwrap();
    let b = manager.get_or_create("/books/b.xlsx").unwrap();
    assert_ne!(a.id(), b.id());
    assert_ne!(a.pid(), b.pid());
    assert_eq!(launcher.launches(), 2);

    let a_again = manager.get_or_create("/books/./a.xlsx").unwrap();
    assert_eq!(a_again.id(), a.id());
}

#[test]
fn test_fail_fast_close_refuses_busy_session() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/report.xlsx").unwrap();
    let host = launcher.host_for("/books/report.xlsx").unwrap();
    let worker = start_stuck_batch(&manager, &session, &host);

    let started = Instant::now();
    let err = manager.close(session.id().as_str(), true).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1), "fail-fast close waited");
    assert!(
        matches!(err, EngineError::Busy { active: 1, .. }),
        "expected Busy, got {err:?}"
    );
    assert_eq!(session.state(), SessionState::Open);
    assert!(!session.info().can_close());
    assert!(host.saves().is_empty(), "a refused close must not save");

    host.release_hangs();
    assert_eq!(worker.join().unwrap().unwrap(), Variant::from("Sheet1"));

    assert!(manager.close(session.id().as_str(), true).unwrap());
    assert_eq!(host.saves(), vec![None]);
    assert!(host.has_quit());
    assert!(host.root_released());
    assert_eq!(host.live_handles(), 0);
    assert!(manager.get(session.id().as_str()).is_none());
}

#[test]
fn test_wait_for_idle_close_waits_for_running_batch() {
    let (launcher, manager) = engine(EngineConfig {
        close_policy: ClosePolicy::WaitForIdle(PATIENCE),
        ..fast_config()
    });
    let session = manager.get_or_create("/books/report.xlsx").unwrap();
    let host = launcher.host_for("/books/report.xlsx").unwrap();
    let worker = start_stuck_batch(&manager, &session, &host);

    let releaser = {
        let host = Arc::clone(&host);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            host.release_hangs();
        })
    };

    let started = Instant::now();
    assert!(manager.close(session.id().as_str(), false).unwrap());
    assert!(started.elapsed() >= Duration::from_millis(100), "close did not wait");
    assert_eq!(worker.join().unwrap().unwrap(), Variant::from("Sheet1"));
    releaser.join().unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(host.has_quit());
    assert_eq!(host.live_handles(), 0);
}

#[test]
fn test_wait_for_idle_close_gives_up_after_its_limit() {
    let (launcher, manager) = engine(EngineConfig {
        close_policy: ClosePolicy::WaitForIdle(Duration::from_millis(100)),
        ..fast_config()
    });
    let session = manager.get_or_create("/books/report.xlsx").unwrap();
    let host = launcher.host_for("/books/report.xlsx").unwrap();
    let worker = start_stuck_batch(&manager, &session, &host);

    let err = manager.close(session.id().as_str(), false).unwrap_err();
    assert!(matches!(err, EngineError::Busy { .. }), "got {err:?}");
    assert_eq!(session.state(), SessionState::Open);

    host.release_hangs();
    worker.join().unwrap().unwrap();
    assert!(manager.close(session.id().as_str(), false).unwrap());
}

#[test]
fn test_closing_session_rejects_new_batches() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/gone.xlsx").unwrap();
    assert!(manager.close(session.id().as_str(), false).unwrap());

    let err = manager
        .executor()
        .execute_once(&session, PATIENCE, |ctx| ctx.root_property("Name"))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }), "got {err:?}");
    assert_eq!(launcher.launches(), 1);
}

#[test]
fn test_session_of_one_opens_and_closes_a_temporary_session() {
    let (launcher, manager) = engine(fast_config());

    let count = manager
        .with_session_of_one("/books/once.xlsx", true, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            ctx.scope().call(&sheets, "Add", &[Variant::from("Summary")])?;
            sheets.get("Count")
        })
        .unwrap();

    assert_eq!(count, Variant::Number(2.0));
    let host = launcher.host_for("/books/once.xlsx").unwrap();
    assert_eq!(host.saves(), vec![None]);
    assert!(host.has_quit());
    assert_eq!(host.live_handles(), 0);
    assert!(manager.list_active().is_empty());
}

#[test]
fn test_session_of_one_closes_even_when_work_fails() {
    let (launcher, manager) = engine(fast_config());

    let err = manager
        .with_session_of_one("/books/once.xlsx", true, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            ctx.scope().item(&sheets, "Missing")?;
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, EngineError::ResourceNotFound { .. }), "got {err:?}");
    let host = launcher.host_for("/books/once.xlsx").unwrap();
    assert!(host.saves().is_empty(), "failed work is not saved");
    assert!(host.has_quit());
    assert!(manager.list_active().is_empty());
}

#[test]
fn test_session_of_one_reuses_an_open_session() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/open.xlsx").unwrap();
    let host = launcher.host_for("/books/open.xlsx").unwrap();
    host.set_value("", "FullName", "open.xlsx");

    let name = manager
        .with_session_of_one("/books/open.xlsx", false, |ctx| ctx.root_property("FullName"))
        .unwrap();

    assert_eq!(name, Variant::from("open.xlsx"));
    assert!(!host.has_quit());
    assert_eq!(launcher.launches(), 1);
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(manager.list_active().len(), 1);
}

#[test]
fn test_session_of_one_does_not_kill_a_session_picked_up_meanwhile() {
    let (launcher, manager) = engine(fast_config());
    let (entered_tx, entered_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let temporary = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            manager.with_session_of_one("/books/shared.xlsx", false, move |ctx| {
                let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
                entered_tx.send(()).unwrap();
                go_rx.recv().unwrap();
                sheets.get("Count")
            })
        })
    };
    entered_rx.recv_timeout(PATIENCE).unwrap();

    let session = manager.get_or_create("/books/shared.xlsx").unwrap();
    let host = launcher.host_for("/books/shared.xlsx").unwrap();
    host.hang_on("Item");
    let other = {
        let manager = Arc::clone(&manager);
        let session = Arc::clone(&session);
        std::thread::spawn(move || {
            manager.executor().execute_once(&session, PATIENCE, |ctx| {
                let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
                let sheet = ctx.scope().item(&sheets, "Sheet1")?;
                sheet.get("Name")
            })
        })
    };
    assert!(
        wait_until(PATIENCE, || session.active_operations() == 2),
        "second batch never queued"
    );
    go_tx.send(()).unwrap();

    assert_eq!(temporary.join().unwrap().unwrap(), Variant::Number(1.0));
    assert!(!host.is_terminated(), "the shared host was killed");
    host.release_hangs();

    match other.join().unwrap() {
        Ok(name) => {
            assert_eq!(name, Variant::from("Sheet1"));
            assert_eq!(session.state(), SessionState::Open);
            assert_eq!(manager.list_active().len(), 1);
        }
        // The temporary close won the race and the batch was turned away
        // before it reached the host.
        Err(EngineError::InvalidState { .. }) => {}
        Err(e) => panic!("second batch broke mid-flight: {e:?}"),
    }
    assert!(!host.is_terminated());
    assert_eq!(host.calls_after_quit(), 0);
}

#[test]
fn test_close_racing_batches_never_reaches_a_quit_host() {
    let (launcher, manager) = engine(EngineConfig {
        close_policy: ClosePolicy::WaitForIdle(PATIENCE),
        ..fast_config()
    });
    let session = manager.get_or_create("/books/race.xlsx").unwrap();
    let host = launcher.host_for("/books/race.xlsx").unwrap();
    let barrier = Arc::new(Barrier::new(5));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let session = Arc::clone(&session);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                loop {
                    let result = manager.executor().execute_once(&session, PATIENCE, |ctx| {
                        let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
                        let sheet = ctx.scope().item(&sheets, "Sheet1")?;
                        sheet.get("Name")
                    });
                    match result {
                        Ok(name) => assert_eq!(name, Variant::from("Sheet1")),
                        Err(EngineError::InvalidState { .. }) => return,
                        Err(e) => panic!("batch failed while racing close: {e:?}"),
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    std::thread::sleep(Duration::from_millis(20));
    assert!(manager.close(session.id().as_str(), false).unwrap());
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(session.state(), SessionState::Closed);
    assert!(host.has_quit());
    assert!(!host.is_terminated());
    assert_eq!(host.calls_after_quit(), 0);
    assert_eq!(host.live_handles(), 0);
    assert_eq!(host.double_releases(), 0);
}
