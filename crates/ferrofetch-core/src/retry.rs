//! Retry loop with constant or exponential backoff.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Retryable;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Constant(Duration),
    /// `base * 2^retry_index`, uncapped.
    Exponential(Duration),
}

impl Backoff {
    pub fn new(base: Duration, exponential: bool) -> Self {
        if exponential {
            Self::Exponential(base)
        } else {
            Self::Constant(base)
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Constant(delay) => delay,
            Self::Exponential(base) => {
                let scale = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(scale)
            }
        }
    }
}

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub retries: u32,
    pub backoff: Backoff,
    /// Randomize each delay within +/- 50%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Backoff::Exponential(Duration::from_secs(1)),
            jitter: false,
        }
    }
}

/// The error that ended a retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    pub error: E,
    /// Attempts made, the first one included.
    pub attempts: u32,
    /// `true` when the error was retryable but the budget ran out.
    pub exhausted: bool,
}

impl<E> RetryFailure<E> {
    pub fn into_inner(self) -> E {
        self.error
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Backoff) -> Self {
        Self {
            retries,
            backoff,
            jitter: false,
        }
    }

    pub fn constant(retries: u32, delay: Duration) -> Self {
        Self::new(retries, Backoff::Constant(delay))
    }

    pub fn exponential(retries: u32, base: Duration) -> Self {
        Self::new(retries, Backoff::Exponential(base))
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        if !self.jitter {
            return delay;
        }

        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let spread = millis / 2;
        let offset = fastrand::u64(0..=spread.saturating_mul(2));
        Duration::from_millis(millis.saturating_sub(spread).saturating_add(offset))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `op` receives the 0-based attempt index.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, RetryFailure<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(op, |error: &E| error.is_retryable()).await
    }

    /// Like [`run`](Self::run) with an explicit retry predicate.
    pub async fn run_with<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0_u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !should_retry(&error) {
                        return Err(RetryFailure {
                            error,
                            attempts: attempt + 1,
                            exhausted: false,
                        });
                    }
                    if attempt >= self.retries {
                        return Err(RetryFailure {
                            error,
                            attempts: attempt + 1,
                            exhausted: true,
                        });
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        retries = self.retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::FetchError;

    #[test]
    fn constant_backoff_never_grows() {
        let backoff = Backoff::Constant(Duration::from_millis(100));

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = Backoff::Exponential(Duration::from_millis(100));

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_saturates_instead_of_overflowing() {
        let backoff = Backoff::Exponential(Duration::from_secs(1));
        assert!(backoff.delay(64) >= backoff.delay(31));
    }

    #[test]
    fn jitter_stays_within_half_of_the_delay() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100)).with_jitter(true);

        for _ in 0..10 {
            for attempt in 0..4 {
                let expected = 100.0 * 2_f64.powi(attempt as i32);
                let delay_ms = policy.delay_for_attempt(attempt).as_millis() as f64;
                assert!(delay_ms >= expected * 0.5, "attempt={attempt}, delay_ms={delay_ms}");
                assert!(delay_ms <= expected * 1.5, "attempt={attempt}, delay_ms={delay_ms}");
            }
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_with_three_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::constant(3, Duration::from_millis(1));

        let counter = Arc::clone(&calls);
        let result = policy
            .run(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if call < 3 {
                        Err(FetchError::fetch(format!("flaky call {call}")))
                    } else {
                        Ok("quote")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("quote"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retries_plus_one_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::constant(2, Duration::from_millis(1));

        let counter = Arc::clone(&calls);
        let failure = policy
            .run(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchError::transport("proxy", "connection refused"))
                }
            })
            .await
            .expect_err("always fails");

        assert!(failure.exhausted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::constant(5, Duration::from_millis(1));

        let counter = Arc::clone(&calls);
        let failure = policy
            .run(|_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FetchError::api_call(404, "proxy", "not found"))
                }
            })
            .await
            .expect_err("404 is final");

        assert!(!failure.exhausted);
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_follow_the_exponential_schedule() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));

        let recorder = Arc::clone(&stamps);
        let _ = policy
            .run(|_| {
                let recorder = Arc::clone(&recorder);
                async move {
                    recorder
                        .lock()
                        .expect("stamps lock")
                        .push(started.elapsed().as_millis());
                    Err::<(), _>(FetchError::fetch("down"))
                }
            })
            .await;

        let stamps = stamps.lock().expect("stamps lock").clone();
        assert_eq!(stamps, vec![0, 100, 300, 700]);
    }
}
