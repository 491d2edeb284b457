use crate::constants::retry as retry_constants;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

/// Bounded exponential backoff. `max_attempts` counts the first try.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::auth_propagation()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    /// Covers the lag between pushing a key and sshd accepting it.
    pub fn auth_propagation() -> Self {
        Self {
            max_attempts: retry_constants::AUTH_MAX_ATTEMPTS,
            base_delay_ms: retry_constants::AUTH_BASE_DELAY_MS,
            max_delay_ms: retry_constants::AUTH_MAX_DELAY_MS,
            jitter: retry_constants::JITTER,
        }
    }

    pub fn concurrency_conflict() -> Self {
        Self {
            max_attempts: retry_constants::CONFLICT_MAX_ATTEMPTS,
            base_delay_ms: retry_constants::CONFLICT_BASE_DELAY_MS,
            max_delay_ms: retry_constants::CONFLICT_MAX_DELAY_MS,
            jitter: retry_constants::JITTER,
        }
    }

    pub fn fixed(max_attempts: usize, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter: 0.0,
        }
    }

    fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor: f64 = 2.0;
        let mut delay =
            (self.base_delay_ms as f64) * factor.powi(attempt.saturating_sub(1).min(30) as i32);
        if delay > self.max_delay_ms as f64 {
            delay = self.max_delay_ms as f64;
        }
        if self.jitter > 0.0 {
            let delta = delay * self.jitter;
            delay = delay - delta + rand::random::<f64>() * delta * 2.0;
        }
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Runs `op` until it succeeds, returns a non-retryable error, runs out
    /// of attempts, or the next sleep would pass `deadline`. The last error
    /// is returned on exhaustion.
    pub fn run_blocking<T, E>(
        &self,
        deadline: Option<Instant>,
        should_retry: impl Fn(&E) -> bool,
        mut op: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.attempts() || !should_retry(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    if let Some(deadline) = deadline {
                        if Instant::now() + delay >= deadline {
                            return Err(err);
                        }
                    }
                    std::thread::sleep(delay);
                }
            }
        }
    }

    pub async fn run_async<T, E, F, Fut>(
        &self,
        should_retry: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.attempts() || !should_retry(&err) {
                        return Err(err);
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                }
            }
        }
    }
}
