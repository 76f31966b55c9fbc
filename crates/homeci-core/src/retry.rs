//! Bounded retry with growing per-attempt timeouts.
//!
//! Every outbound call goes through [`RetryExecutor::execute`]. An attempt is
//! given a cancellation token that fires when its timeout elapses (or when the
//! caller's token fires); the attempt future is also dropped at that point.
//! The next attempt starts immediately with a timeout `backoff_factor` times
//! longer, so worst-case latency is bounded by the sum of all timeouts.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default number of attempts.
pub const DEFAULT_ATTEMPTS: u32 = 5;
/// Default timeout of the first attempt.
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(1);
/// Default multiplier applied to the timeout after each failed attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.4;
/// Upper bound on any single attempt's timeout.
pub const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Attempt ceiling and timeout schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_timeout: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Per-attempt timeouts, one per attempt, in order. Each is capped at
    /// [`MAX_ATTEMPT_TIMEOUT`].
    pub fn timeouts(&self) -> impl Iterator<Item = Duration> + '_ {
        let mut next = self.initial_timeout.min(MAX_ATTEMPT_TIMEOUT);
        (0..self.attempts).map(move |_| {
            let current = next;
            next = Duration::try_from_secs_f64(next.as_secs_f64() * self.backoff_factor)
                .map_or(MAX_ATTEMPT_TIMEOUT, |grown| grown.min(MAX_ATTEMPT_TIMEOUT));
            current
        })
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("maximum retry attempts exceeded ({attempts} attempts): {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, the attempts run out, or `cancel` fires.
    ///
    /// `operation` receives a per-attempt token (a child of `cancel`) and must
    /// return promptly once it is triggered. `on_retry` is called with the
    /// attempt index (1, 2, ...) before every attempt except the first.
    ///
    /// Cancellation is checked at the top of every attempt: once `cancel` has
    /// fired no further attempt starts and [`RetryError::Cancelled`] is returned.
    pub async fn execute<T, E, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<T, RetryError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        R: FnMut(u32),
    {
        let mut last_error = String::from("no attempt was made");

        for (attempt, timeout) in (0u32..).zip(self.policy.timeouts()) {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            if attempt > 0 {
                on_retry(attempt);
            }

            let attempt_token = cancel.child_token();
            let outcome = tokio::select! {
                result = operation(attempt_token.clone()) => Some(result),
                _ = tokio::time::sleep(timeout) => None,
            };
            attempt_token.cancel();

            match outcome {
                Some(Ok(value)) => return Ok(value),
                Some(Err(err)) => last_error = err.to_string(),
                None => {
                    last_error = format!("attempt timed out after {}ms", timeout.as_millis())
                }
            }
        }

        Err(RetryError::MaxRetriesExceeded {
            attempts: self.policy.attempts,
            last_error,
        })
    }
}

/// Race `future` against `token`, mapping cancellation to `on_cancel()`.
///
/// Used by retry operations that wrap futures which are not token-aware.
pub async fn until_cancelled<T, E, Fut>(
    token: &CancellationToken,
    future: Fut,
    on_cancel: impl FnOnce() -> E,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(on_cancel()),
        result = future => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn hook_recorder() -> (std::sync::Arc<Mutex<Vec<u32>>>, impl FnMut(u32)) {
        let calls = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&calls);
        (calls, move |n| sink.lock().unwrap().push(n))
    }

    #[test]
    fn default_policy_timeouts_grow_by_backoff_factor() {
        let timeouts: Vec<Duration> = RetryPolicy::default().timeouts().collect();
        assert_eq!(timeouts.len(), 5);
        assert_eq!(timeouts[0], Duration::from_secs(1));
        for pair in timeouts.windows(2) {
            let ratio = pair[1].as_secs_f64() / pair[0].as_secs_f64();
            assert!((ratio - 1.4).abs() < 1e-6, "ratio was {ratio}");
        }
    }

    #[test]
    fn huge_backoff_saturates_instead_of_overflowing() {
        let policy = RetryPolicy {
            attempts: 40,
            initial_timeout: Duration::from_secs(1),
            backoff_factor: 1.0e20,
        };
        let timeouts: Vec<Duration> = policy.timeouts().collect();
        assert_eq!(timeouts.len(), 40);
        assert_eq!(timeouts[0], Duration::from_secs(1));
        assert!(timeouts[1..].iter().all(|t| *t == MAX_ATTEMPT_TIMEOUT));

        let nan = RetryPolicy {
            backoff_factor: f64::NAN,
            ..RetryPolicy::default()
        };
        assert!(nan.timeouts().all(|t| t <= MAX_ATTEMPT_TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_backoff_still_runs_the_operation() {
        let policy = RetryPolicy {
            attempts: 20,
            initial_timeout: Duration::from_secs(1),
            backoff_factor: 10.0,
        };
        let result = RetryExecutor::new(policy)
            .execute(
                &CancellationToken::new(),
                |_| async { Ok::<_, String>(7) },
                |_| {},
            )
            .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt() {
        let attempts = AtomicU32::new(0);
        let (hooks, on_retry) = hook_recorder();

        let result = RetryExecutor::default()
            .execute(
                &CancellationToken::new(),
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>("success") }
                },
                on_retry,
            )
            .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(hooks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn eventual_success_after_two_failures() {
        let attempts = AtomicU32::new(0);
        let (hooks, on_retry) = hook_recorder();

        let result = RetryExecutor::default()
            .execute(
                &CancellationToken::new(),
                |_| {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err("fail".to_string())
                        } else {
                            Ok("success")
                        }
                    }
                },
                on_retry,
            )
            .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*hooks.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_exceeds_max_retries() {
        let attempts = AtomicU32::new(0);
        let (hooks, on_retry) = hook_recorder();

        let result: Result<(), RetryError> = RetryExecutor::default()
            .execute(
                &CancellationToken::new(),
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("boom") }
                },
                on_retry,
            )
            .await;

        match result {
            Err(RetryError::MaxRetriesExceeded {
                attempts: n,
                last_error,
            }) => {
                assert_eq!(n, 5);
                assert_eq!(last_error, "boom");
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert_eq!(*hooks.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_between_attempts_stops_retrying() {
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let (hooks, on_retry) = hook_recorder();

        let result: Result<(), RetryError> = RetryExecutor::default()
            .execute(
                &cancel,
                |_| {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        cancel.cancel();
                    }
                    async { Err::<(), _>("fail") }
                },
                on_retry,
            )
            .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(hooks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError> = RetryExecutor::default()
            .execute(
                &cancel,
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<(), String>(()) }
                },
                |_| {},
            )
            .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_until_budget_suffices() {
        // Each attempt needs 2s; timeouts are 1s, 1.4s, 1.96s, 2.744s.
        let attempts = AtomicU32::new(0);
        let (hooks, on_retry) = hook_recorder();

        let result = RetryExecutor::default()
            .execute(
                &CancellationToken::new(),
                |token: CancellationToken| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(2)) => Ok("success"),
                            _ = token.cancelled() => Err("attempt cancelled"),
                        }
                    }
                },
                on_retry,
            )
            .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(*hooks.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported_as_last_error() {
        let policy = RetryPolicy {
            attempts: 2,
            initial_timeout: Duration::from_millis(100),
            backoff_factor: 1.5,
        };

        let result: Result<(), RetryError> = RetryExecutor::new(policy)
            .execute(
                &CancellationToken::new(),
                |_| std::future::pending::<Result<(), String>>(),
                |_| {},
            )
            .await;

        match result {
            Err(RetryError::MaxRetriesExceeded {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out after 150ms"), "{last_error}");
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn until_cancelled_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = until_cancelled(&token, async { Ok::<_, &str>(1) }, || "cancelled").await;
        assert_eq!(result, Err("cancelled"));
    }
}
