//! Retry logic under a circuit breaker.
//!
//! Transient failures (timeouts, connect errors, 5xx, 429) are retried with jittered
//! exponential backoff while the breaker admits calls. Non-transient failures return
//! immediately and do not count against the breaker. Retrying stops when the caller's
//! future is dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ResilienceConfig;
use crate::resilience::backoff::{jittered_delay, retry_after_delay};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::timeouts::with_timeout;

/// Classification of a failed attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Server-provided delay before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retry_after: Duration,
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        }
    }
}

impl RetryPolicy {
    /// Same delays, but a failed attempt is final.
    pub fn single_attempt(self) -> Self {
        Self {
            max_attempts: 1,
            ..self
        }
    }

    /// Wait before the retry following failed attempt `attempt`, or `None` to give up.
    fn delay_after(&self, attempt: u32, hint: Option<Duration>) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        match hint {
            Some(hint) if hint > self.max_retry_after => None,
            Some(hint) => Some(retry_after_delay(hint)),
            None => Some(jittered_delay(attempt, self.base_delay, self.max_delay)),
        }
    }
}

#[derive(Debug)]
pub enum CallError<E> {
    /// Rejected by the breaker without calling.
    CircuitOpen {
        dependency: String,
        retry_after: Option<Duration>,
    },
    /// The last attempt exceeded its deadline.
    TimedOut(Duration),
    /// The last attempt failed.
    Failed(E),
}

/// Run `op` through `breaker`, retrying transient failures per `policy`, with
/// `timeout` applied to every attempt.
pub async fn execute<T, E, F, Fut>(
    breaker: &Arc<CircuitBreaker>,
    policy: &RetryPolicy,
    timeout: Duration,
    mut op: F,
) -> Result<T, CallError<E>>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        let permit = breaker.try_acquire().map_err(|rejected| CallError::CircuitOpen {
            dependency: breaker.name().to_string(),
            retry_after: rejected.retry_after,
        })?;

        let (error, hint) = match with_timeout(timeout, op()).await {
            Ok(Ok(value)) => {
                permit.success();
                return Ok(value);
            }
            Ok(Err(e)) if !e.is_transient() => {
                permit.neutral();
                return Err(CallError::Failed(e));
            }
            Ok(Err(e)) => {
                permit.failure();
                let hint = e.retry_after();
                (CallError::Failed(e), hint)
            }
            Err(timed_out) => {
                permit.failure();
                (CallError::TimedOut(timed_out.0), None)
            }
        };

        let Some(delay) = policy.delay_after(attempt, hint) else {
            return Err(error);
        };

        tracing::debug!(
            dependency = %breaker.name(),
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %DisplayCallError(&error),
            "Retrying transient upstream failure"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

struct DisplayCallError<'a, E>(&'a CallError<E>);

impl<E: std::fmt::Display> std::fmt::Display for DisplayCallError<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            CallError::CircuitOpen { dependency, .. } => write!(f, "circuit open for {dependency}"),
            CallError::TimedOut(limit) => write!(f, "timed out after {limit:?}"),
            CallError::Failed(e) => e.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{BreakerSettings, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        transient: bool,
        retry_after: Option<Duration>,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error")
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn transient() -> TestError {
        TestError {
            transient: true,
            retry_after: None,
        }
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "api",
            BreakerSettings {
                failure_threshold: threshold,
                rolling_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
            },
        ))
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let op = move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok("ok")
            }
        };
        let result = execute(&breaker(10), &policy(3), Duration::from_secs(1), op).await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let b = breaker(1);
        let op = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError {
                transient: false,
                retry_after: None,
            })
        };
        let result = execute(&b, &policy(3), Duration::from_secs(1), op).await;

        assert!(matches!(result, Err(CallError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_and_are_retried() {
        let calls = &AtomicU32::new(0);
        let op = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), TestError>(())
        };
        let result = execute(&breaker(10), &policy(2), Duration::from_millis(50), op).await;

        assert!(matches!(result, Err(CallError::TimedOut(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_calling() {
        let b = breaker(2);
        let calls = &AtomicU32::new(0);
        let op = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        };

        let first = execute(&b, &policy(5), Duration::from_secs(1), op).await;
        assert!(matches!(first, Err(CallError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let second = execute(&b, &policy(5), Duration::from_secs(1), op).await;
        assert!(matches!(second, Err(CallError::CircuitOpen { retry_after: Some(_), .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_overrides_backoff() {
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let op = move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TestError {
                    transient: true,
                    retry_after: Some(Duration::from_secs(3)),
                })
            } else {
                Ok(())
            }
        };
        let result = execute(&breaker(10), &policy(2), Duration::from_secs(1), op).await;

        assert!(result.is_ok());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_millis(4600));
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_policy_never_retries() {
        let calls = &AtomicU32::new(0);
        let op = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        };
        let once = policy(5).single_attempt();
        let result = execute(&breaker(10), &once, Duration::from_secs(1), op).await;

        assert!(matches!(result, Err(CallError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_is_not_waited() {
        let calls = &AtomicU32::new(0);
        let op = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError {
                transient: true,
                retry_after: Some(Duration::from_secs(120)),
            })
        };
        let result = execute(&breaker(10), &policy(3), Duration::from_secs(1), op).await;

        assert!(matches!(result, Err(CallError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
