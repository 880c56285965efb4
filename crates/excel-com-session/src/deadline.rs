//! Running a blocking call against a deadline.
//!
//! Host calls cannot be interrupted. The only way to stop waiting for one is
//! to run it on its own thread and stop listening; the thread keeps running
//! until the host answers or is killed.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::error::{EngineError, Result};

pub(crate) enum Outcome<T> {
    Completed(T),
    Panicked(String),
    /// The deadline passed. The worker may still be running.
    TimedOut(Straggler),
}

/// A worker that outlived its deadline.
pub(crate) struct Straggler {
    done: mpsc::Receiver<()>,
}

impl Straggler {
    /// Wait up to `timeout` for the worker to exit. True if it did.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.done.recv_timeout(timeout),
            Ok(()) | Err(RecvTimeoutError::Disconnected)
        )
    }
}

pub(crate) fn run_with_deadline<T, F>(name: String, timeout: Duration, f: F) -> Result<Outcome<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (result_tx, result_rx) = mpsc::sync_channel(1);
    let (done_tx, done_rx) = mpsc::channel::<()>();

    thread::Builder::new()
        .name(name)
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = result_tx.send(result);
            drop(done_tx);
        })
        .map_err(|e| EngineError::fatal(format!("failed to start worker thread: {e}")))?;

    Ok(match result_rx.recv_timeout(timeout) {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(payload)) => Outcome::Panicked(panic_message(payload.as_ref())),
        Err(RecvTimeoutError::Timeout) => Outcome::TimedOut(Straggler { done: done_rx }),
        Err(RecvTimeoutError::Disconnected) => {
            Outcome::Panicked("worker exited without a result".to_string())
        }
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
