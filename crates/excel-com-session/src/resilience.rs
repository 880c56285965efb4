//! Retry with backoff for transient host faults.

use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

/// When and how often to retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each attempt after that.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that is randomized, `0.0..=1.0`.
    pub jitter: f64,
    pub is_retryable: fn(&EngineError) -> bool,
}

static TRANSIENT_HOST: Lazy<RetryPolicy> = Lazy::new(|| RetryPolicy {
    max_attempts: 3,
    base_delay: Duration::from_millis(200),
    max_delay: Duration::from_secs(5),
    jitter: 0.25,
    is_retryable: EngineError::is_transient,
});

impl RetryPolicy {
    /// The process-wide policy for transient cross-process faults.
    pub fn transient_host() -> &'static RetryPolicy {
        &TRANSIENT_HOST
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 never waits).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(20);
        let nominal = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        nominal.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        TRANSIENT_HOST.clone()
    }
}

/// Runs fallible operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct ResiliencePipeline {
    policy: RetryPolicy,
}

impl ResiliencePipeline {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `attempt` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget runs out. `attempt` receives the 1-based attempt
    /// number.
    pub fn run<T>(&self, op_name: &str, mut attempt: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut n = 1;
        loop {
            match attempt(n) {
                Ok(value) => {
                    if n > 1 {
                        info!(op = op_name, attempt = n, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !(self.policy.is_retryable)(&err) => {
                    debug!(op = op_name, attempt = n, error = %err, "not retryable");
                    return Err(err);
                }
                Err(err) if n >= max_attempts => {
                    warn!(op = op_name, attempts = n, error = %err, "retries exhausted");
                    return Err(EngineError::RetriesExhausted {
                        attempts: n,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    n += 1;
                    let delay = self.policy.backoff(n);
                    warn!(
                        op = op_name,
                        attempt = n,
                        max_attempts,
                        hresult = ?err.hresult().map(|h| format!("0x{:08X}", h as u32)),
                        ?delay,
                        "transient host fault, retrying: {err}"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

impl Default for ResiliencePipeline {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
