//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::resilience::RetryPolicy;

/// What `close` does when the session still has operations in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Refuse immediately with `Busy`.
    FailFast,
    /// Wait up to the given duration for the session to go idle, then refuse
    /// with `Busy`.
    WaitForIdle(Duration),
}

impl Default for ClosePolicy {
    fn default() -> Self {
        ClosePolicy::FailFast
    }
}

/// Configuration for [`SessionManager`](crate::SessionManager) and
/// [`BatchExecutor`](crate::BatchExecutor).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for a batch when the caller does not pass one.
    pub default_timeout: Duration,
    pub close_policy: ClosePolicy,
    /// How long close waits for the execution lock before giving up and
    /// terminating the host.
    pub close_lock_timeout: Duration,
    /// Bound on `save` and `quit` during close.
    pub shutdown_timeout: Duration,
    pub retry: RetryPolicy,
    /// Bound on the watchdog's ping of a suspect host.
    pub ping_timeout: Duration,
    /// How long the watchdog waits for an abandoned host call to return
    /// once the host has answered a ping.
    pub abandon_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            close_policy: ClosePolicy::default(),
            close_lock_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            retry: RetryPolicy::transient_host().clone(),
            ping_timeout: Duration::from_secs(5),
            abandon_grace: Duration::from_secs(30),
        }
    }
}

/// Configuration for the status channel endpoint.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Socket path on Unix, pipe name on Windows. `None` picks the per-user
    /// default from [`default_endpoint`](crate::status::default_endpoint).
    pub endpoint: Option<PathBuf>,
    /// Requests longer than this are rejected.
    pub max_request_bytes: usize,
    /// A client that has not sent a full line within this time is answered
    /// with an error and disconnected.
    pub read_timeout: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_request_bytes: 64 * 1024,
            read_timeout: Duration::from_secs(5),
        }
    }
}
