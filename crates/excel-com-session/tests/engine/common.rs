//! Shared helpers for engine tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use excel_com_session::testing::FakeLauncher;
use excel_com_session::{EngineConfig, RetryPolicy, SessionManager};

/// Upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Engine settings scaled down so retries and watchdog verdicts happen in
/// milliseconds.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        default_timeout: PATIENCE,
        close_lock_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::transient_host().clone()
        },
        ping_timeout: Duration::from_millis(200),
        abandon_grace: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

pub fn engine(config: EngineConfig) -> (Arc<FakeLauncher>, Arc<SessionManager>) {
    let launcher = FakeLauncher::new();
    let manager = Arc::new(SessionManager::new(launcher.clone(), config));
    (launcher, manager)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
