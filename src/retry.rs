//! Retry and timeout utilities.
//!
//! Used by the registration client to ride out a chat server that is still
//! starting, and by key lookups that must not wait forever on a reply.

use std::future::Future;
use std::time::Duration;

use rsa::rand_core::{OsRng, RngCore};
use tracing::debug;

/// How often to try a connection and how long to wait in between.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries. Zero is treated as one.
    pub max_attempts: usize,
    /// Wait after the first failure. Doubles after each later one.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Each wait is stretched by a random amount up to this.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Two quick attempts, for calls where a caller is actively waiting.
    pub fn low_latency() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(100),
            jitter: Duration::from_millis(25),
        }
    }

    /// Policy used when opening the registration socket.
    pub fn registration() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(1),
            jitter: Duration::from_millis(50),
        }
    }

    /// Single attempt, no delay.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Wait before retrying after failed `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.base_delay(attempt) + random_jitter(self.jitter)
    }

    fn base_delay(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::low_latency()
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// policy runs out of attempts.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Random wait in `0..=max`, in whole milliseconds.
fn random_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(OsRng.next_u64() % max_ms.saturating_add(1))
}
