//! # Retry Policy
//!
//! One object decides how often and how long to retry an RPC attempt. Call sites
//! hand it a closure producing a single attempt; the policy applies the per-attempt
//! deadline, classifies the error and lets `backoff` drive the exponential delays.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

use crate::error::RpcError;

/// Ceiling for a single delay, whatever the attempt count.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Bounded exponential backoff.
///
/// The delay after failed attempt `n` (0-based) is `initial_backoff * 2^n`, capped at
/// one minute. Every retryable failure is followed by its delay, including the last
/// one, so a source that keeps answering 429 sees `max_attempts` calls spaced
/// `1x, 2x, 4x ...` before the error is surfaced.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, never zero.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Deadline applied to each attempt individually.
    pub attempt_timeout: Duration,
    retryable: fn(&RpcError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5), Duration::from_secs(30))
    }
}

/// `ExponentialBackoff` that gives out one delay per allowed attempt.
struct Schedule {
    delays: ExponentialBackoff,
    attempts: u32,
    remaining: u32,
}

impl Backoff for Schedule {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.remaining = self.remaining.checked_sub(1)?;
        self.delays.next_backoff()
    }

    fn reset(&mut self) {
        self.delays.reset();
        self.remaining = self.attempts;
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            attempt_timeout,
            retryable: RpcError::is_transient,
        }
    }

    /// Replaces the retryable-error predicate.
    pub fn with_predicate(mut self, retryable: fn(&RpcError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Same policy with a different per-attempt deadline.
    pub fn with_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn should_retry(&self, err: &RpcError) -> bool {
        (self.retryable)(err)
    }

    fn schedule(&self) -> Schedule {
        let delays = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(MAX_DELAY.max(self.initial_backoff))
            .with_max_elapsed_time(None)
            .build();
        Schedule {
            delays,
            attempts: self.max_attempts,
            remaining: self.max_attempts,
        }
    }

    /// Delays handed out by a fresh schedule, in order.
    pub fn delays(&self) -> Vec<Duration> {
        let mut schedule = self.schedule();
        schedule.reset();
        std::iter::from_fn(|| schedule.next_backoff()).collect()
    }

    /// Drives `attempt` until it succeeds, fails permanently, or the attempts run out.
    ///
    /// The closure receives the 0-based attempt index. On exhaustion the last error
    /// is returned unchanged.
    pub async fn run<T, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T, RpcError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        // The schedule sleeps after the last failure too; that error is parked here
        // and handed back by the call that follows the final delay.
        let exhausted: Mutex<Option<RpcError>> = Mutex::new(None);
        let mut index = 0u32;

        let operation = || {
            let n = index;
            index += 1;
            let call = (n < self.max_attempts).then(|| attempt(n));
            let exhausted = &exhausted;
            async move {
                let Some(call) = call else {
                    let last = exhausted.lock().ok().and_then(|mut slot| slot.take());
                    let err = last.unwrap_or_else(|| RpcError::Transport(format!("{label}: no attempt made")));
                    return Err(backoff::Error::permanent(err));
                };
                let err = match tokio::time::timeout(self.attempt_timeout, call).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(err)) => err,
                    Err(_) => RpcError::Timeout,
                };
                if self.should_retry(&err) {
                    Err(backoff::Error::transient(err))
                } else {
                    Err(backoff::Error::permanent(err))
                }
            }
        };

        let mut failures = 0u32;
        let notify = |err: RpcError, delay: Duration| {
            failures += 1;
            warn!(
                method = label,
                attempt = failures,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "RPC attempt failed, backing off"
            );
            if let Ok(mut slot) = exhausted.lock() {
                *slot = Some(err);
            }
        };

        backoff::future::retry_notify(self.schedule(), operation, notify).await
    }
}
