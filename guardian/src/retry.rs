//! Retry fallible operations with Fibonacci backoff.
//!
//! The same [Policy] governs artifact downloads and endpoint reconnects: up to
//! [Policy::attempts] tries, sleeping `backoff * fib(n)` before retry `n` (so a 5s backoff
//! waits 5s, 5s, 10s, 15s, ...).

use std::{future::Future, time::Duration};
use tracing::{debug, warn};

/// Default maximum number of attempts.
pub const DEFAULT_ATTEMPTS: usize = 5;

/// Default backoff unit.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Bounded retry with Fibonacci backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    /// Maximum number of attempts (including the first one). Zero is treated as one.
    pub attempts: usize,

    /// Unit multiplied by the Fibonacci sequence to compute each delay.
    pub backoff: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl Policy {
    pub fn new(attempts: usize, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Delay to wait before attempt `attempt` (zero-indexed). The first attempt never waits.
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(fibonacci(attempt)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` is passed the zero-indexed attempt number. The error of the last attempt is
    /// returned on exhaustion.
    pub async fn run<T, E, F, Fut>(&self, label: &'static str, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.delay(attempt);
                debug!(label, attempt, ?delay, "backing off");
                tokio::time::sleep(delay).await;
            }
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= attempts {
                        warn!(label, attempts, %err, "retries exhausted");
                        return Err(err);
                    }
                    warn!(label, attempt, %err, "attempt failed");
                }
            }
        }
    }
}

/// The `n`th Fibonacci number where `fib(0) = 0` and `fib(1) = fib(2) = 1`.
fn fibonacci(n: usize) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a.saturating_add(b));
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn test_fibonacci() {
        let seq: Vec<u64> = (0..8).map(fibonacci).collect();
        assert_eq!(seq, vec![0, 1, 1, 2, 3, 5, 8, 13]);
        assert_eq!(fibonacci(500), u64::MAX);
    }

    #[test]
    fn test_delays() {
        let policy = Policy::default();
        let delays: Vec<u64> = (1..5).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 5, 10, 15]);
        assert_eq!(policy.delay(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_succeeds_on_last_attempt() {
        let policy = Policy::new(5, Duration::from_millis(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<usize, String> = policy
            .run("test", |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 4 {
                        return Err(format!("attempt {attempt} failed"));
                    }
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let policy = Policy::new(5, Duration::from_millis(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<(), String> = policy
            .run("test", |attempt| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(format!("attempt {attempt} failed"))
                }
            })
            .await;
        assert_eq!(result, Err("attempt 4 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let policy = Policy::new(0, Duration::from_millis(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<(), &str> = policy
            .run("test", |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("failed")
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
