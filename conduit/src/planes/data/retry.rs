use crate::domain::RetryConfig;
use crate::planes::data::backoff::Backoff;
use crate::ports::{ErrorStatus, OpFuture, Operation};
use shared::Result;
use std::fmt::{self, Debug, Display};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type BeforeRetry<E> = Arc<dyn Fn(&E, u32, Duration) + Send + Sync>;
type OnFailure<E> = Arc<dyn Fn(&E, u32) + Send + Sync>;

/// Every permitted attempt failed and no fallback value was configured
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<E: Display> Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "retries exhausted after {} attempt(s): {}",
            self.attempts, self.last_error
        )
    }
}

impl<E> std::error::Error for RetryExhausted<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Re-invokes a failed operation on a backoff schedule.
///
/// Attempts are strictly sequential. The callbacks only observe; they have no
/// say in whether another attempt is made.
pub struct RetryPolicy<T, E> {
    config: RetryConfig,
    backoff: Backoff,
    predicate: RetryPredicate<E>,
    fallback: Option<T>,
    before_retry: Option<BeforeRetry<E>>,
    on_failure: Option<OnFailure<E>>,
}

impl<T, E> RetryPolicy<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Policy retrying transient failures: errors whose status is in
    /// `retryable_error_codes`, or transport errors with no status at all
    pub fn new(config: RetryConfig) -> Result<Self>
    where
        E: ErrorStatus,
    {
        let codes = config.retryable_error_codes.clone();
        Self::with_predicate(config, move |error: &E| match error.status_code() {
            Some(code) => codes.contains(&code),
            None => error.is_transport(),
        })
    }

    /// Policy whose eligibility is decided entirely by `predicate`
    pub fn with_predicate<P>(config: RetryConfig, predicate: P) -> Result<Self>
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            backoff: Backoff::from(&config),
            config,
            predicate: Arc::new(predicate),
            fallback: None,
            before_retry: None,
            on_failure: None,
        })
    }

    /// Replace the eligibility predicate
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Succeed with `value` instead of failing
    pub fn fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    pub fn before_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&E, u32, Duration) + Send + Sync + 'static,
    {
        self.before_retry = Some(Arc::new(callback));
        self
    }

    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&E, u32) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry `n` (0-indexed)
    pub fn delay_for(&self, n: u32) -> Duration {
        self.backoff.delay(n)
    }

    pub async fn run<O, A>(&self, op: &O, args: A) -> std::result::Result<T, RetryExhausted<E>>
    where
        O: Operation<A, T, E> + ?Sized,
        A: Clone,
    {
        let mut retries: u32 = 0;

        loop {
            let error = match op.call(args.clone()).await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Operation succeeded after {} retry(ies)", retries);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if retries >= self.config.max_retries || !(self.predicate)(&error) {
                let attempts = retries + 1;
                if let Some(ref on_failure) = self.on_failure {
                    on_failure(&error, attempts);
                }
                if let Some(ref fallback) = self.fallback {
                    warn!("Operation failed after {} attempt(s), using fallback value", attempts);
                    return Ok(fallback.clone());
                }
                warn!("Operation failed after {} attempt(s)", attempts);
                return Err(RetryExhausted {
                    attempts,
                    last_error: error,
                });
            }

            let delay = self.backoff.delay(retries);
            retries += 1;
            if let Some(ref before_retry) = self.before_retry {
                before_retry(&error, retries, delay);
            }
            debug!(
                strategy = %self.backoff.strategy(),
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

impl<T, E> Debug for RetryPolicy<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// An operation re-invoked on failure according to a [`RetryPolicy`].
///
/// After exhaustion the caller sees the last error of the wrapped operation.
pub struct Retrying<O, T, E> {
    inner: Arc<O>,
    policy: Arc<RetryPolicy<T, E>>,
    _marker: PhantomData<fn() -> E>,
}

impl<O, T, E> Retrying<O, T, E> {
    pub fn new(inner: O, policy: RetryPolicy<T, E>) -> Self {
        Self {
            inner: Arc::new(inner),
            policy: Arc::new(policy),
            _marker: PhantomData,
        }
    }

    pub fn policy(&self) -> &RetryPolicy<T, E> {
        &self.policy
    }
}

impl<O, A, T, E> Operation<A, T, E> for Retrying<O, T, E>
where
    O: Operation<A, T, E>,
    A: Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn call(&self, args: A) -> OpFuture<T, E> {
        let inner = Arc::clone(&self.inner);
        let policy = Arc::clone(&self.policy);
        Box::pin(async move {
            policy
                .run(inner.as_ref(), args)
                .await
                .map_err(|exhausted| exhausted.last_error)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BackoffStrategy;
    use parking_lot::Mutex;
    use shared::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries, BackoffStrategy::Exponential)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(1000))
    }

    /// Fails with `error` for the first `failures` calls, then succeeds
    fn flaky(
        calls: Arc<AtomicU32>,
        failures: u32,
        error: Error,
    ) -> impl Fn(()) -> OpFuture<&'static str, Error> + Send + Sync + 'static {
        move |_: ()| -> OpFuture<&'static str, Error> {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            let error = error.clone();
            Box::pin(async move {
                if call < failures {
                    Err(error)
                } else {
                    Ok("booked")
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(config(3)).unwrap();

        let result = policy
            .run(&flaky(Arc::clone(&calls), 2, Error::status(503, "busy")), ())
            .await;

        assert_eq!(result.unwrap(), "booked");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(config(2)).unwrap();

        let result = policy
            .run(&flaky(Arc::clone(&calls), 10, Error::status(500, "boom")), ())
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.last_error, Error::status(500, "boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(config(5)).unwrap();

        let result = policy
            .run(&flaky(Arc::clone(&calls), 10, Error::status(404, "missing")), ())
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(config(1)).unwrap();

        let result = policy
            .run(&flaky(Arc::clone(&calls), 1, Error::transport("reset")), ())
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_overrides_status_codes() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(config(3))
            .unwrap()
            .retry_if(|error: &Error| error.status_code() == Some(404));

        let ok = policy
            .run(&flaky(Arc::clone(&calls), 1, Error::status(404, "not yet")), ())
            .await;
        assert!(ok.is_ok());

        calls.store(0, Ordering::SeqCst);
        let failed = policy
            .run(&flaky(Arc::clone(&calls), 1, Error::status(503, "busy")), ())
            .await;
        assert_eq!(failed.unwrap_err().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_value_on_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(config(1)).unwrap().fallback("waitlisted");

        let result = policy
            .run(&flaky(Arc::clone(&calls), 10, Error::status(503, "busy")), ())
            .await;

        assert_eq!(result.unwrap(), "waitlisted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_follow_backoff_schedule() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&observed);
        let failed = Arc::clone(&failures);

        let policy = RetryPolicy::new(config(5))
            .unwrap()
            .before_retry(move |_: &Error, attempt, delay| seen.lock().push((attempt, delay)))
            .on_failure(move |_: &Error, total| failed.lock().push(total));

        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result = policy
            .run(&flaky(Arc::clone(&calls), 10, Error::status(503, "busy")), ())
            .await;

        assert!(result.is_err());
        let delays: Vec<u64> = observed
            .lock()
            .iter()
            .map(|(_, d)| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
        let attempts: Vec<u32> = observed.lock().iter().map(|(a, _)| *a).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
        assert_eq!(*failures.lock(), vec![6]);
        assert!(started.elapsed() >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrapper_propagates_original_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let op = Retrying::new(
            flaky(Arc::clone(&calls), 10, Error::status(502, "bad gateway")),
            RetryPolicy::new(config(2)).unwrap(),
        );

        let result = op.call(()).await;

        assert_eq!(result.unwrap_err(), Error::status(502, "bad gateway"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_invalid_config_is_rejected_at_construction() {
        let config = RetryConfig::new(3, BackoffStrategy::Exponential)
            .initial_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1));
        let policy = RetryPolicy::<(), Error>::new(config);
        assert!(matches!(policy, Err(Error::Configuration(_))));
    }
}
