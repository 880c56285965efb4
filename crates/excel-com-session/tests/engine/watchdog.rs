//! Suspect sessions after a timed-out batch.

use std::time::Duration;

use excel_com_session::{EngineError, SessionState, Variant};

use crate::{engine, fast_config, wait_until, PATIENCE};

const SHORT_DEADLINE: Duration = Duration::from_millis(100);

#[test]
fn test_hung_host_is_terminated() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/modal.xlsx").unwrap();
    let host = launcher.host_for("/books/modal.xlsx").unwrap();
    host.hang_on("Item");
    host.hang_on("Ping");

    let err = manager
        .executor()
        .execute_once(&session, SHORT_DEADLINE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            ctx.scope().item(&sheets, "Sheet1")?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::TimedOut { .. }), "got {err:?}");

    let err = manager
        .executor()
        .execute_once(&session, PATIENCE, |ctx| ctx.root_property("FullName"))
        .unwrap_err();
    assert!(
        matches!(err, EngineError::InvalidState { .. }),
        "suspect session accepted a batch: {err:?}"
    );

    assert!(
        wait_until(PATIENCE, || session.state() == SessionState::Closed),
        "watchdog never closed the session"
    );
    assert!(host.is_terminated());
    assert!(manager.list_active().is_empty());
    assert!(manager.get(session.id().as_str()).is_none());
    assert!(
        !manager.close(session.id().as_str(), false).unwrap(),
        "a terminated session is not found"
    );

    let reopened = manager.get_or_create("/books/modal.xlsx").unwrap();
    assert_ne!(reopened.id(), session.id());
    assert_eq!(launcher.launches(), 2);
}

#[test]
fn test_host_that_answers_and_finishes_recovers() {
    let (launcher, manager) = engine(fast_config());
    let session = manager.get_or_create("/books/slow.xlsx").unwrap();
    let host = launcher.host_for("/books/slow.xlsx").unwrap();
    host.set_value("", "FullName", "slow.xlsx");
    host.hang_on("Item");

    let err = manager
        .executor()
        .execute_once(&session, SHORT_DEADLINE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            ctx.scope().item(&sheets, "Sheet1")?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::TimedOut { .. }), "got {err:?}");
    assert!(session.is_suspect());

    host.release_hangs();
    assert!(
        wait_until(PATIENCE, || !session.is_suspect()),
        "session never recovered"
    );
    assert_eq!(session.state(), SessionState::Open);
    assert!(!host.is_terminated());
    assert!(
        wait_until(PATIENCE, || host.live_handles() == 0),
        "abandoned batch leaked handles"
    );

    let name = manager
        .executor()
        .execute_once(&session, PATIENCE, |ctx| ctx.root_property("FullName"))
        .unwrap();
    assert_eq!(name, Variant::from("slow.xlsx"));
}

#[test]
fn test_abandoned_call_that_never_returns_is_terminated() {
    let (launcher, manager) = engine(excel_com_session::EngineConfig {
        abandon_grace: Duration::from_millis(200),
        ..fast_config()
    });
    let session = manager.get_or_create("/books/stuck.xlsx").unwrap();
    let host = launcher.host_for("/books/stuck.xlsx").unwrap();
    host.hang_on("Item");

    manager
        .executor()
        .execute_once(&session, SHORT_DEADLINE, |ctx| {
            let sheets = ctx.scope().get(&ctx.root(), "Worksheets")?;
            ctx.scope().item(&sheets, "Sheet1")?;
            Ok(())
        })
        .unwrap_err();

    assert!(
        wait_until(PATIENCE, || session.state() == SessionState::Closed),
        "watchdog never closed the session"
    );
    assert!(host.is_terminated());
    assert_eq!(host.calls("Ping"), 1, "host was pinged before being judged");
}
