//! Batch execution: handle cleanup, failure isolation and retries.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use excel_com_session::{EngineError, SessionState, TransientCode, Variant};
use pretty_assertions::assert_eq;

use crate::{engine, fast_config, wait_until, PATIENCE};

#[test]
fn test_nested_handle_failure_leaves_session_reusable() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("wb1").unwrap();
    let host = launcher.host_for("wb1").unwrap();

    let err = manager
        .executor()
        .execute_once(&session, PATIENCE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            let sheet = ctx.scope().item(&sheets, "Sheet1")?;
            let _charts = ctx.scope().get(&sheet, "ChartObjects")?;
            sheet.get("NoSuchProperty")?;
            Ok(())
        })
        .unwrap_err();

    assert!(
        matches!(err, EngineError::ResourceNotFound { .. }),
        "expected ResourceNotFound, got {err:?}"
    );
    assert_eq!(host.live_handles(), 0, "every nested handle is released");
    assert_eq!(host.double_releases(), 0);
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(session.active_operations(), 0);
    assert!(!session.is_suspect());

    let count = manager
        .executor()
        .execute_once(&session, PATIENCE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            sheets.get("Count")
        })
        .unwrap();
    assert_eq!(count, Variant::Number(1.0));
    assert_eq!(host.live_handles(), 0);
}

#[test]
fn test_panicking_batch_frees_the_lock() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/panic.xlsx").unwrap();
    let host = launcher.host_for("/books/panic.xlsx").unwrap();

    let err = manager
        .executor()
        .execute_once(&session, PATIENCE, |ctx| -> excel_com_session::Result<()> {
            let _sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            panic!("formatting went wrong");
        })
        .unwrap_err();

    assert!(err.to_string().contains("formatting went wrong"), "got: {err}");
    assert_eq!(host.live_handles(), 0);
    assert_eq!(session.active_operations(), 0);

    let name = manager
        .executor()
        .execute_once(&session, PATIENCE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            let first = ctx.scope().item(&sheets, 1)?;
            first.get("Name")
        })
        .unwrap();
    assert_eq!(name, Variant::from("Sheet1"));
}

#[test]
fn test_timed_out_batch_frees_the_lock_for_close() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/slow.xlsx").unwrap();
    let host = launcher.host_for("/books/slow.xlsx").unwrap();
    host.hang_on("Item");

    let err = manager
        .executor()
        .execute_once(&session, Duration::from_millis(100), |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            ctx.scope().item(&sheets, "Sheet1")?;
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, EngineError::TimedOut { .. }), "got {err:?}");
    assert_eq!(session.active_operations(), 0);
    assert!(session.is_suspect());

    assert!(manager.close(session.id().as_str(), false).unwrap());
    assert!(!host.has_quit(), "a host with a call still in flight is not asked to quit");
    assert!(host.is_terminated());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(manager.list_active().is_empty());
}

#[test]
fn test_suspect_session_refuses_to_close_with_save() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/slow.xlsx").unwrap();
    let host = launcher.host_for("/books/slow.xlsx").unwrap();
    host.hang_on("Item");

    manager
        .executor()
        .execute_once(&session, Duration::from_millis(100), |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            ctx.scope().item(&sheets, "Sheet1")?;
            Ok(())
        })
        .unwrap_err();
    assert!(session.is_suspect());

    let err = manager.close(session.id().as_str(), true).unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }), "got {err:?}");
    assert_eq!(session.state(), SessionState::Open);
    assert!(host.saves().is_empty());
    assert_eq!(host.calls_after_quit(), 0);

    host.release_hangs();
    assert!(
        wait_until(PATIENCE, || !session.is_suspect()),
        "session never recovered"
    );
    assert!(manager.close(session.id().as_str(), true).unwrap());
    assert_eq!(host.saves(), vec![None]);
    assert!(host.has_quit());
    assert!(!host.is_terminated());
}

#[test]
fn test_transient_faults_are_retried_until_success() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/busy.xlsx").unwrap();
    let host = launcher.host_for("/books/busy.xlsx").unwrap();
    host.fail_on("Count", TransientCode::CallRejected.hresult(), Some(2));

    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    let count = manager
        .executor()
        .execute(&session, PATIENCE, move |ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            sheets.get("Count")
        })
        .unwrap();

    assert_eq!(count, Variant::Number(1.0));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(host.calls("Count"), 3);
    assert_eq!(host.live_handles(), 0, "each attempt disposes its own scope");
}

#[test]
fn test_persistent_transient_fault_exhausts_the_budget() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/modal.xlsx").unwrap();
    let host = launcher.host_for("/books/modal.xlsx").unwrap();
    host.fail_on("Count", TransientCode::RetryLater.hresult(), None);

    let err = manager
        .executor()
        .execute(&session, PATIENCE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            sheets.get("Count")
        })
        .unwrap_err();

    match err {
        EngineError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(
                *last,
                EngineError::Transient {
                    code: TransientCode::RetryLater,
                    ..
                }
            ));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(host.calls("Count"), 3);
    assert_eq!(session.active_operations(), 0);
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_fatal_faults_are_not_retried() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/broken.xlsx").unwrap();
    let host = launcher.host_for("/books/broken.xlsx").unwrap();
    host.fail_on("Count", 0x8000_4005, None);

    let err = manager
        .executor()
        .execute(&session, PATIENCE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            sheets.get("Count")
        })
        .unwrap_err();

    assert!(matches!(err, EngineError::Fatal { .. }), "got {err:?}");
    assert_eq!(err.hresult().map(|h| h as u32), Some(0x8000_4005));
    assert_eq!(host.calls("Count"), 1);
}

#[test]
fn test_batches_on_one_session_run_one_at_a_time() {
    let (_launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/shared.xlsx").unwrap();
    let running = Arc::new(AtomicU32::new(0));
    let overlap = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let session = Arc::clone(&session);
            let running = Arc::clone(&running);
            let overlap = Arc::clone(&overlap);
            std::thread::spawn(move || {
                manager.executor().execute_once(&session, PATIENCE, move |ctx| {
                    if running.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                    let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
                    let count = sheets.get("Count");
                    running.fetch_sub(1, Ordering::SeqCst);
                    count
                })
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap().unwrap();
    }
    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    assert_eq!(session.active_operations(), 0);
}
