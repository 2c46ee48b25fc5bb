//! Exponential backoff budget owned by one runner instance.

use std::time::Duration;

/// Outcome of recording a failure against a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry { delay: Duration },
    /// No budget left; the last error is terminal.
    Exhausted,
}

/// Stateful retry budget.
///
/// `delay` and `timeout` double on every recorded failure up to their caps and
/// never shrink; `remaining` only counts down and is never reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    remaining: u32,
    delay: Duration,
    max_delay: Option<Duration>,
    timeout: Duration,
    max_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Unbounded caps until [`with_max_delay`](Self::with_max_delay) or
    /// [`with_max_timeout`](Self::with_max_timeout) set them.
    pub fn new(retries: u32, delay: Duration, timeout: Duration) -> Self {
        Self {
            remaining: retries,
            delay,
            max_delay: None,
            timeout,
            max_timeout: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self.delay = cap(self.delay, self.max_delay);
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = Some(max_timeout);
        self.timeout = cap(self.timeout, self.max_timeout);
        self
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Delay that the next retry will wait.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Startup timeout for the current attempt.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a failure and decide whether to retry.
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.remaining == 0 {
            return RetryDecision::Exhausted;
        }
        self.remaining -= 1;
        let scheduled = self.delay;
        self.delay = cap(self.delay.saturating_mul(2), self.max_delay);
        self.timeout = cap(self.timeout.saturating_mul(2), self.max_timeout);
        RetryDecision::Retry { delay: scheduled }
    }
}

fn cap(value: Duration, max: Option<Duration>) -> Duration {
    match max {
        Some(max) => value.min(max),
        None => value,
    }
}
