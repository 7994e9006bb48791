use crate::domain::{BackoffStrategy, RetryConfig};
use rand::Rng;
use std::time::Duration;

/// Delay schedule derived from a [`RetryConfig`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    strategy: BackoffStrategy,
    initial: Duration,
    max: Duration,
    increment: Duration,
}

impl Backoff {
    pub fn new(
        strategy: BackoffStrategy,
        initial: Duration,
        max: Duration,
        increment: Duration,
    ) -> Self {
        Self {
            strategy,
            initial,
            max,
            increment,
        }
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    /// Delay before retry `n` (0-indexed)
    pub fn delay(&self, n: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::FixedDelay => self.initial,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(n).unwrap_or(u32::MAX);
                self.capped(self.initial.saturating_mul(factor))
            }
            BackoffStrategy::Fibonacci => {
                let factor = u32::try_from(fibonacci(n + 1)).unwrap_or(u32::MAX);
                self.capped(self.initial.saturating_mul(factor))
            }
            BackoffStrategy::Random => {
                if self.max <= self.initial {
                    return self.initial;
                }
                let low = self.initial.as_millis() as u64;
                let high = self.max.as_millis() as u64;
                Duration::from_millis(rand::rng().random_range(low..=high))
            }
            BackoffStrategy::Incremental => {
                let step = self.increment.saturating_mul(n);
                self.capped(self.initial.saturating_add(step))
            }
        }
    }

    fn capped(&self, delay: Duration) -> Duration {
        delay.min(self.max)
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.strategy,
            config.initial_delay,
            config.max_delay,
            config.increment,
        )
    }
}

// fib(1) = fib(2) = 1
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}
