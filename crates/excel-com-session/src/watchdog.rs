//! Verdicts on sessions whose batch timed out.
//!
//! A timed-out batch leaves its host call running. The session is suspect
//! until the watchdog decides: if the host answers a ping and the abandoned
//! call finishes within the grace period, the session is usable again;
//! otherwise the host process is killed and the session is closed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use crate::deadline::{run_with_deadline, Outcome, Straggler};
use crate::session::{Session, SessionState};

/// Runs after the watchdog has closed a session, so its owner can forget it.
#[derive(Clone)]
pub(crate) struct TerminationHook(Arc<dyn Fn(&Session) + Send + Sync>);

impl TerminationHook {
    pub(crate) fn new(hook: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }
}

impl std::fmt::Debug for TerminationHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TerminationHook")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The host answered and the abandoned call came back.
    Recovered,
    /// The host was killed and the session closed.
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    ping_timeout: Duration,
    grace: Duration,
    on_terminated: Option<TerminationHook>,
}

impl Watchdog {
    pub fn new(ping_timeout: Duration, grace: Duration) -> Self {
        Self {
            ping_timeout,
            grace,
            on_terminated: None,
        }
    }

    pub(crate) fn on_terminated(mut self, hook: TerminationHook) -> Self {
        self.on_terminated = Some(hook);
        self
    }

    /// Judge `session` on a background thread.
    pub(crate) fn spawn(&self, session: Arc<Session>, straggler: Straggler) -> Option<JoinHandle<Verdict>> {
        let watchdog = self.clone();
        let name = format!("watchdog-{}", session.id());
        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || watchdog.judge(&session, &straggler));
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to start watchdog thread");
                None
            }
        }
    }

    pub(crate) fn judge(&self, session: &Arc<Session>, straggler: &Straggler) -> Verdict {
        if session.state() == SessionState::Closed {
            return self.terminate(session, "session already closed");
        }

        if !self.ping(session) {
            return self.terminate(session, "host did not answer a ping after a timed-out batch");
        }

        if !straggler.wait(self.grace) {
            return self.terminate(session, "abandoned host call did not return");
        }
        if session.state() == SessionState::Closed {
            return self.terminate(session, "session closed while being judged");
        }
        session.clear_suspect();
        info!(session = %session.id(), "host recovered after timed-out batch");
        Verdict::Recovered
    }

    fn terminate(&self, session: &Session, reason: &str) -> Verdict {
        session.terminate(reason);
        if let Some(hook) = &self.on_terminated {
            (hook.0)(session);
        }
        Verdict::Terminated
    }

    fn ping(&self, session: &Arc<Session>) -> bool {
        let host = Arc::clone(session.host());
        let name = format!("ping-{}", session.id());
        match run_with_deadline(name, self.ping_timeout, move || host.ping()) {
            Ok(Outcome::Completed(Ok(()))) => true,
            Ok(Outcome::Completed(Err(fault))) => {
                warn!(session = %session.id(), %fault, "ping failed");
                false
            }
            Ok(Outcome::TimedOut(_)) => {
                warn!(session = %session.id(), timeout = ?self.ping_timeout, "ping timed out");
                false
            }
            Ok(Outcome::Panicked(msg)) => {
                warn!(session = %session.id(), %msg, "ping panicked");
                false
            }
            Err(e) => {
                warn!(session = %session.id(), error = %e, "could not ping host");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FileIdentity, SessionId};
    use crate::testing::FakeHost;

    fn suspect_session(host: Arc<FakeHost>) -> Arc<Session> {
        let s = Arc::new(Session::new(
            SessionId::new("w-1"),
            FileIdentity::new("/books/w.xlsx"),
            host,
            false,
        ));
        s.mark_suspect();
        s
    }

    fn finished_straggler() -> Straggler {
        match run_with_deadline("s".into(), Duration::ZERO, || std::thread::sleep(Duration::from_millis(20))) {
            Ok(Outcome::TimedOut(s)) => s,
            _ => panic!("expected a straggler"),
        }
    }

    #[test]
    fn responsive_host_is_cleared() {
        let host = FakeHost::new();
        let session = suspect_session(host.clone());
        let dog = Watchdog::new(Duration::from_secs(2), Duration::from_secs(2));
        assert_eq!(dog.judge(&session, &finished_straggler()), Verdict::Recovered);
        assert!(!session.is_suspect());
        assert!(session.is_open());
    }

    #[test]
    fn hung_host_is_terminated() {
        let host = FakeHost::new();
        host.hang_on("Ping");
        let session = suspect_session(host.clone());
        let dog = Watchdog::new(Duration::from_millis(50), Duration::from_secs(2));
        assert_eq!(dog.judge(&session, &finished_straggler()), Verdict::Terminated);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(host.is_terminated());
    }

    #[test]
    fn termination_is_reported_to_the_owner() {
        let host = FakeHost::new();
        host.hang_on("Ping");
        let session = suspect_session(host);
        let reported = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&reported);
        let dog = Watchdog::new(Duration::from_millis(50), Duration::from_secs(2))
            .on_terminated(TerminationHook::new(move |s| seen.lock().push(s.id().clone())));

        dog.judge(&session, &finished_straggler());

        assert_eq!(*reported.lock(), vec![SessionId::new("w-1")]);
    }
}
