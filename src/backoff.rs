use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::cancel::CancelSignal;

/// Configuration for [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First wait and the wait restored by [`Backoff::reset`].
    pub base: Duration,
    /// Ceiling for the exponential part of the wait.
    pub max: Duration,
    /// Upper bound (exclusive) of the random jitter added to every wait.
    pub max_jitter: Duration,
}

impl BackoffConfig {
    pub const DEFAULT_BASE: Duration = Duration::from_millis(200);
    pub const DEFAULT_MAX: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            base: BackoffConfig::DEFAULT_BASE,
            max: BackoffConfig::DEFAULT_MAX,
            max_jitter: BackoffConfig::DEFAULT_MAX_JITTER,
        }
    }
}

/// Exponential backoff with jitter.
///
/// There is no retry limit: once `current` reaches the ceiling every wait stays around
/// `max + jitter` until [`Backoff::reset`] is called.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Backoff {
        Backoff {
            config,
            current: config.base,
        }
    }

    /// Return the next wait and double the underlying duration, up to the ceiling.
    pub fn next(&mut self) -> Duration {
        let wait = self.current.saturating_add(jitter(self.config.max_jitter));
        self.current = self
            .current
            .saturating_mul(2)
            .min(self.config.max.max(self.config.base));
        wait
    }

    /// Restore the base duration. Call after any successful operation.
    pub fn reset(&mut self) {
        self.current = self.config.base;
    }

    /// Block for [`Backoff::next`] or until `cancel` fires. Returns `true` if cancelled.
    pub fn wait(&mut self, cancel: &CancelSignal) -> bool {
        let wait = self.next();
        log::debug!(target: "flag_engine", "backing off for {:?}", wait);
        cancel.wait_timeout(wait)
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::new(BackoffConfig::default())
    }
}

fn jitter(max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }
    thread_rng().gen_range(Duration::ZERO..max_jitter)
}
