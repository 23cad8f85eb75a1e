//! Bounded exponential-backoff retry.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Retry budget for one call site.
///
/// Settings are passed explicitly wherever a retry happens; there is no
/// process-wide default that call sites silently share.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per further retry.
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn new(max_retries: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    /// Delay before retry number `attempt` (1-indexed): `base * factor^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);

        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return Duration::MAX;
        }
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }
}

/// Every attempt failed.
#[derive(Debug, Error)]
#[error("retries exhausted after {attempts} attempt(s): {last_error}")]
pub struct RetriesExhausted<E> {
    /// Attempts made, including the first one.
    pub attempts: u32,
    #[source]
    pub last_error: E,
}

impl<E> RetriesExhausted<E> {
    /// Retries spent after the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn map_err<F>(self, f: impl FnOnce(E) -> F) -> RetriesExhausted<F> {
        RetriesExhausted {
            attempts: self.attempts,
            last_error: f(self.last_error),
        }
    }
}

/// Progress of one [`execute`] invocation. Never outlives the call.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    next_delay: Duration,
}

impl RetryState {
    /// Record a failure. Hands the error back once the budget is spent,
    /// otherwise keeps it for the caller to report and retry.
    fn record_failure<E>(&mut self, error: E, settings: &RetrySettings) -> Result<E, RetriesExhausted<E>> {
        self.attempt += 1;
        if self.attempt > settings.max_retries {
            return Err(RetriesExhausted {
                attempts: self.attempt,
                last_error: error,
            });
        }
        self.next_delay = settings.delay_for_attempt(self.attempt);
        Ok(error)
    }
}

/// Run `operation` until it succeeds or the retry budget is spent.
///
/// Every error is retryable. Before each retry `on_retry(attempt, delay, &error)`
/// is called and the task sleeps for `delay`. The sleep is a tokio timer, so it
/// only suspends this future; other tasks on the runtime keep running.
pub async fn execute<T, E, Op, Fut, OnRetry>(
    settings: RetrySettings,
    mut on_retry: OnRetry,
    mut operation: Op,
) -> Result<T, RetriesExhausted<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    OnRetry: FnMut(u32, Duration, &E),
{
    let mut state = RetryState::default();

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let error = state.record_failure(error, &settings)?;
        on_retry(state.attempt, state.next_delay, &error);
        tokio::time::sleep(state.next_delay).await;
    }
}

/// [`execute`] with a `warn!` per retry, labelled with `what`.
pub async fn execute_logged<T, E, Op, Fut>(
    settings: RetrySettings,
    what: &str,
    operation: Op,
) -> Result<T, RetriesExhausted<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: core::fmt::Display,
{
    execute(
        settings,
        |attempt, delay, error: &E| {
            warn!(
                what,
                attempt,
                max_retries = settings.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "operation failed; retrying"
            );
        },
        operation,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(max_retries: u32) -> RetrySettings {
        RetrySettings::new(max_retries, Duration::from_millis(100), 2.0)
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let s = settings(5);

        assert_eq!(s.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(s.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(s.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(s.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(s.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn fractional_factor_and_overflow_are_handled() {
        let s = RetrySettings::new(3, Duration::from_millis(1000), 1.5);
        assert_eq!(s.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(s.delay_for_attempt(3), Duration::from_millis(2250));

        let huge = RetrySettings::new(3, Duration::from_secs(1), 1e12);
        assert_eq!(huge.delay_for_attempt(40), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_three_failures() {
        let calls = AtomicU32::new(0);

        let result = execute(settings(3), |_, _, _: &&str| {}, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n <= 3 { Err("boom") } else { Ok(n) } }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_exhausts_after_max_plus_one_calls() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = execute(settings(3), |_, _, _: &String| {}, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("failure {n}")) }
        })
        .await;

        let exhausted = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(exhausted.attempts, 4);
        assert_eq!(exhausted.retries(), 3);
        assert_eq!(exhausted.last_error, "failure 4");
    }

    #[tokio::test(start_paused = true)]
    async fn on_retry_sees_the_backoff_schedule() {
        let mut observed = Vec::new();
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = execute(
            settings(3),
            |attempt, delay, _: &&str| observed.push((attempt, delay)),
            || async { Err("nope") },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(
            observed,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200)),
                (3, Duration::from_millis(400)),
            ]
        );
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_makes_a_single_attempt() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = execute(RetrySettings::no_retry(), |_, _, _: &&str| {}, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("once") }
        })
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_does_not_leak_between_invocations() {
        let s = settings(1);
        for _ in 0..3 {
            let result: Result<(), _> = execute(s, |_, _, _: &&str| {}, || async { Err("x") }).await;
            assert_eq!(result.unwrap_err().attempts, 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_backoffs_do_not_block_each_other() {
        let slow = execute(settings(2), |_, _, _: &&str| {}, || async { Err::<(), _>("slow") });
        let fast = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            "fast done"
        };

        let start = tokio::time::Instant::now();
        let (slow_result, fast_result) = tokio::join!(slow, fast);

        assert!(slow_result.is_err());
        assert_eq!(fast_result, "fast done");
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn record_failure_hands_the_error_back_until_the_budget_is_spent() {
        let s = settings(1);
        let mut state = RetryState::default();

        assert_eq!(state.record_failure("first", &s).unwrap(), "first");
        assert_eq!(state.next_delay, Duration::from_millis(100));

        let exhausted = state.record_failure("second", &s).unwrap_err();
        assert_eq!(exhausted.attempts, 2);
        assert_eq!(exhausted.last_error, "second");
    }

    #[derive(Debug, Error, PartialEq)]
    #[error("store offline")]
    struct Offline;

    #[test]
    fn exhaustion_exposes_the_last_error_as_its_source() {
        let exhausted = RetriesExhausted {
            attempts: 4,
            last_error: Offline,
        };

        assert_eq!(exhausted.to_string(), "retries exhausted after 4 attempt(s): store offline");
        assert_eq!(exhausted.retries(), 3);
        let source = std::error::Error::source(&exhausted).unwrap();
        assert_eq!(source.to_string(), "store offline");
    }
}
