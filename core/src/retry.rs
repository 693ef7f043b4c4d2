//! Bounded retry with exponential backoff.
//!
//! Operations against shared state occasionally fail for reasons that
//! resolve themselves (unique-constraint collisions, serialization
//! failures). [retry_with_backoff] wraps such an operation with a bounded
//! retry loop: delays double from a base up to a cap, and exhausting the
//! attempt budget surfaces the last error rather than swallowing it.
//!
//! Time is injected through the [Clock] trait so the loop can be tested
//! without waiting: [ManualClock] records requested sleeps and advances a
//! virtual clock instead of blocking.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

/// Time source for backoff delays.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current time.
    fn current(&self) -> SystemTime;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;
}

/// Wall-clock [Clock] backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        tokio::time::sleep(duration)
    }
}

/// Virtual [Clock] that never blocks.
///
/// Sleeps complete immediately, advancing the virtual time by the requested
/// duration and recording it for inspection. Useful for tests and
/// simulations of time-dependent behavior.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    /// Create a clock starting at `now`.
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Advance the virtual time.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += duration;
    }

    /// All sleep durations requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn current(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
        std::future::ready(())
    }
}

/// Bounds for [retry_with_backoff].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt; later delays double from here.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given zero-based failed attempt.
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error returned by the final attempt.
        #[source]
        source: E,
    },

    /// The operation failed with an error the caller considers permanent.
    #[error(transparent)]
    Aborted(#[from] E),
}

/// Run `op` until it succeeds, retrying errors accepted by `retryable` with
/// exponentially increasing delays.
///
/// A non-retryable error is returned immediately as
/// [RetryError::Aborted]; exceeding `policy.max_attempts` returns
/// [RetryError::Exhausted] carrying the final error.
pub async fn retry_with_backoff<C, T, E, F, Fut>(
    clock: &C,
    policy: &BackoffPolicy,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    C: Clock,
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) => return Err(RetryError::Aborted(err)),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                let delay = policy.delay(attempt - 1);
                debug!(attempt, ?delay, error = %err, "retrying after backoff");
                clock.sleep(delay).await;
            }
        }
    }
}
