use std::{thread, time::Duration};

use log::debug;

/// Bounded wait for asynchronous device events: a fixed number of attempts
/// with a fixed interval. Injectable so tests run without the sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Runs `attempt` until it yields a value or the attempts are
    /// exhausted; `what` names the awaited resource in logs.
    pub fn run<T>(&self, what: &str, mut attempt: impl FnMut(u32) -> Option<T>) -> Option<T> {
        for n in 1..=self.max_attempts {
            if let Some(value) = attempt(n) {
                return Some(value);
            }
            if n < self.max_attempts {
                debug!("{what} not ready (attempt {n}/{}), retrying", self.max_attempts);
                thread::sleep(self.interval);
            }
        }
        None
    }
}
