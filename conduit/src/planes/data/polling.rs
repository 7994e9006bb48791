use crate::domain::{PollConfig, StopReason};
use crate::ports::Operation;
use shared::{Error, Result};
use std::fmt::{self, Debug};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type StopWhen<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type OnAttempt<T> = Arc<dyn Fn(u32, Option<&T>) + Send + Sync>;
type OnComplete<T> = Arc<dyn Fn(Option<&T>, StopReason) + Send + Sync>;

/// Final state of a polling loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollOutcome<T, E> {
    /// Value of the most recent successful attempt
    pub last_value: Option<T>,
    /// Error of the most recent attempt, when it failed
    pub last_error: Option<E>,
    pub reason: StopReason,
    pub attempts: u32,
}

/// Repeatedly invokes an operation until a stop condition holds.
///
/// The first attempt starts immediately and later ones start on a fixed
/// `interval` grid measured from the first. Attempts never overlap: one that
/// overruns its slot pushes the next start back to when it settled, and the
/// grid continues from there.
pub struct PollPolicy<T> {
    config: PollConfig,
    stop_when: Option<StopWhen<T>>,
    on_attempt: Option<OnAttempt<T>>,
    on_complete: Option<OnComplete<T>>,
}

impl<T> PollPolicy<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(config: PollConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stop_when: None,
            on_attempt: None,
            on_complete: None,
        })
    }

    /// Stop as soon as a successful attempt satisfies `predicate`
    pub fn stop_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.stop_when = Some(Arc::new(predicate));
        self
    }

    pub fn on_attempt<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, Option<&T>) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(callback));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&T>, StopReason) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Poll until a stop condition holds or `cancel` fires.
    ///
    /// Cancellation only prevents further attempts; an attempt already
    /// running is allowed to settle.
    pub async fn run<O, A, E>(&self, op: &O, args: A, cancel: CancellationToken) -> PollOutcome<T, E>
    where
        O: Operation<A, T, E> + ?Sized,
        A: Clone,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;
        let mut last_value: Option<T> = None;
        let mut last_error: Option<E> = None;
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = ticker.tick() => {}
            }
            if self.deadline_passed(started) {
                break StopReason::MaxDuration;
            }

            attempts += 1;
            match op.call(args.clone()).await {
                Ok(value) => {
                    last_error = None;
                    if let Some(ref on_attempt) = self.on_attempt {
                        on_attempt(attempts, Some(&value));
                    }
                    let done = self.stop_when.as_ref().is_some_and(|stop| stop(&value));
                    last_value = Some(value);
                    if done {
                        break StopReason::Predicate;
                    }
                }
                Err(error) => {
                    if let Some(ref on_attempt) = self.on_attempt {
                        on_attempt(attempts, None);
                    }
                    last_error = Some(error);
                    if !self.config.continue_on_error {
                        break StopReason::Error;
                    }
                    debug!(attempt = attempts, "Poll attempt failed, continuing");
                }
            }

            if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                break StopReason::MaxAttempts;
            }
            if self.deadline_passed(started) {
                break StopReason::MaxDuration;
            }
        };

        info!(attempts, reason = %reason, "Polling stopped");
        if let Some(ref on_complete) = self.on_complete {
            on_complete(last_value.as_ref(), reason);
        }

        PollOutcome {
            last_value,
            last_error,
            reason,
            attempts,
        }
    }

    /// Run the loop on its own task
    pub fn spawn<O, A, E>(self, op: O, args: A) -> PollHandle<T, E>
    where
        O: Operation<A, T, E>,
        A: Clone + Send + 'static,
        E: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(&op, args, token).await });
        PollHandle { cancel, task }
    }

    fn deadline_passed(&self, started: Instant) -> bool {
        self.config
            .max_duration
            .is_some_and(|max| started.elapsed() >= max)
    }
}

impl<T> Debug for PollPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollPolicy")
            .field("config", &self.config)
            .field("has_stop_predicate", &self.stop_when.is_some())
            .finish()
    }
}

/// Control over a polling loop running on its own task
pub struct PollHandle<T, E> {
    cancel: CancellationToken,
    task: JoinHandle<PollOutcome<T, E>>,
}

impl<T, E> PollHandle<T, E> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to stop
    pub async fn outcome(self) -> Result<PollOutcome<T, E>> {
        match self.task.await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(Error::Internal(format!("polling task failed: {}", err))),
        }
    }
}
