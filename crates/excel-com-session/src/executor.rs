//! Batched execution against one session.
//!
//! A batch is one unit of work run while holding the session's execution
//! lock, inside a fresh [`HandleScope`], on a worker thread raced against a
//! deadline. Whatever happens to the work (success, error, panic, timeout)
//! the lock is released and the active operation count is restored before
//! [`BatchExecutor::execute`] returns.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use excel_com_protocol::Variant;
use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::deadline::{panic_message, run_with_deadline, Outcome};
use crate::error::{EngineError, Result};
use crate::handle::{HandleScope, ObjectRef};
use crate::resilience::ResiliencePipeline;
use crate::session::{Session, SessionId, SessionState};
use crate::watchdog::{TerminationHook, Watchdog};

/// Set when the caller stopped waiting for a batch.
///
/// Host calls cannot be interrupted, so this is advisory: long-running work
/// should call [`check`](Self::check) between host calls and bail out.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// `Err` once the batch has been abandoned.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::fatal("batch was cancelled after its deadline"))
        } else {
            Ok(())
        }
    }
}

/// Everything a batch's work function can reach.
pub struct BatchContext {
    session: Arc<Session>,
    scope: HandleScope,
    deadline: Instant,
    token: CancellationToken,
    attempt: u32,
}

impl BatchContext {
    fn new(session: Arc<Session>, token: CancellationToken, deadline: Instant, attempt: u32) -> Self {
        let scope = HandleScope::new(Arc::clone(session.root()));
        Self {
            session,
            scope,
            deadline,
            token,
            attempt,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.session.id()
    }

    /// The workbook the session has open.
    pub fn root(&self) -> ObjectRef<'_> {
        self.scope.root()
    }

    /// Scope that releases every handle acquired by this batch.
    pub fn scope(&self) -> &HandleScope {
        &self.scope
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// 1-based; greater than one when the batch is being retried.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.token.check()
    }

    /// Save the workbook, optionally under a new path.
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        self.token.check()?;
        self.session.host().save(path)?;
        Ok(())
    }

    /// Show or hide the host's window.
    pub fn set_visible(&self, visible: bool) -> Result<()> {
        self.token.check()?;
        self.session.host().set_visible(visible)?;
        self.session.set_visible_flag(visible);
        Ok(())
    }

    /// Shorthand for reading a property of the root object.
    pub fn root_property(&self, name: &str) -> Result<Variant> {
        self.root().get(name)
    }

    fn finish(self) {
        if self.session.state() == SessionState::Closed {
            let abandoned = self.scope.abandon();
            debug!(session = %self.session.id(), abandoned, "host gone; handles abandoned");
        } else {
            self.scope.dispose();
        }
    }
}

/// Runs work against sessions.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    pipeline: ResiliencePipeline,
    watchdog: Watchdog,
    default_timeout: Duration,
}

impl BatchExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            pipeline: ResiliencePipeline::new(config.retry.clone()),
            watchdog: Watchdog::new(config.ping_timeout, config.abandon_grace),
            default_timeout: config.default_timeout,
        }
    }

    /// Run `hook` whenever the watchdog closes a session after a timeout.
    pub(crate) fn on_terminated(mut self, hook: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.watchdog = self.watchdog.on_terminated(TerminationHook::new(hook));
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `work` as a batch, retrying transient host faults.
    ///
    /// `work` may run more than once, so it must be safe to repeat. Each
    /// attempt gets its own scope and its own `timeout`.
    pub fn execute<T, F>(&self, session: &Arc<Session>, timeout: Duration, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&BatchContext) -> Result<T> + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let op_name = format!("batch on session '{}'", session.id());
        self.pipeline.run(&op_name, |attempt| {
            let work = Arc::clone(&work);
            self.attempt(session, timeout, attempt, move |ctx| work(ctx))
        })
    }

    /// Run `work` as a batch exactly once. For work that must not be repeated.
    pub fn execute_once<T, F>(&self, session: &Arc<Session>, timeout: Duration, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BatchContext) -> Result<T> + Send + 'static,
    {
        self.attempt(session, timeout, 1, work)
    }

    fn attempt<T, F>(&self, session: &Arc<Session>, timeout: Duration, attempt: u32, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BatchContext) -> Result<T> + Send + 'static,
    {
        // Counted before the state check so that a concurrent close either
        // sees this operation or this operation sees the close.
        let _active = session.begin_operation();
        ensure_accepting(session)?;

        let guard = session.lock_execution();
        if let Err(e) = ensure_accepting(session) {
            MutexGuard::unlock_fair(guard);
            return Err(e);
        }

        let started = Instant::now();
        let token = CancellationToken::new();
        let worker_session = Arc::clone(session);
        let worker_token = token.clone();
        debug!(session = %session.id(), attempt, ?timeout, "batch started");

        let outcome = run_with_deadline(format!("batch-{}", session.id()), timeout, move || {
            let ctx = BatchContext::new(worker_session, worker_token, started + timeout, attempt);
            let result = panic::catch_unwind(AssertUnwindSafe(|| work(&ctx))).unwrap_or_else(|payload| {
                Err(EngineError::fatal(format!(
                    "batch panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
            ctx.finish();
            result
        });

        session.touch();
        let result = match outcome {
            Ok(Outcome::Completed(result)) => result,
            Ok(Outcome::Panicked(msg)) => Err(EngineError::fatal(format!("batch worker failed: {msg}"))),
            Ok(Outcome::TimedOut(straggler)) => {
                token.cancel();
                session.mark_suspect();
                let elapsed = started.elapsed();
                warn!(session = %session.id(), ?elapsed, "batch timed out; session is suspect");
                self.watchdog.spawn(Arc::clone(session), straggler);
                Err(EngineError::TimedOut {
                    session: session.id().to_string(),
                    elapsed,
                })
            }
            Err(e) => Err(e),
        };
        MutexGuard::unlock_fair(guard);

        match &result {
            Ok(_) => debug!(session = %session.id(), elapsed = ?started.elapsed(), "batch finished"),
            Err(e) => debug!(session = %session.id(), error = %e, "batch failed"),
        }
        result
    }
}

impl Default for BatchExecutor {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

fn ensure_accepting(session: &Session) -> Result<()> {
    if session.is_suspect() {
        return Err(EngineError::invalid_state(
            session.id().as_str(),
            "is suspect after a timed-out batch",
        ));
    }
    match session.state() {
        SessionState::Open => Ok(()),
        state => Err(EngineError::invalid_state(
            session.id().as_str(),
            format!("is {state}"),
        )),
    }
}
