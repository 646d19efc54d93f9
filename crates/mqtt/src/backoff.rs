//! Exponential backoff for broker reconnection.
//!
//! The delay grows geometrically and is capped:
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With `initial = 1s`, `multiplier = 2`, `max = 60s`:
//! 1s, 2s, 4s, 8s, 16s, 32s, 60s, 60s, ...
//!
//! How many attempts are allowed is an [`AttemptLimit`]: derived from the timing
//! parameters, fixed, or unlimited. A device bridge is a long-running daemon, so
//! `max_reconnect_attempts = 0` in the configuration means "retry forever".

use std::time::Duration;

use thiserror::Error;

use super::config::Config;

/// Error type for backoff exhaustion.
#[derive(Debug, Error)]
pub enum BackoffError {
    /// Maximum retry attempts exceeded with the given limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// How many consecutive failed attempts are tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptLimit {
    /// Stop once the delay has saturated at `max_delay`.
    Calculated(u32),
    /// Stop after exactly this many attempts.
    Fixed(u32),
    /// Never give up.
    Unlimited,
}

/// Exponential backoff controller.
///
/// Each failed attempt advances the delay; `reset()` is called when a CONNACK
/// arrives so the next outage starts from the initial delay again.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    limit: AttemptLimit,
}

impl Backoff {
    /// Creates a backoff whose attempt limit is derived from the timing parameters.
    ///
    /// Degenerate parameters (`initial >= max`, `multiplier <= 1.0`) yield a limit of 1.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay: max,
            multiplier,
            attempt: 0,
            limit: AttemptLimit::Calculated(Self::calculate_max_attempts(
                initial, max, multiplier,
            )),
        }
    }

    /// Builds the reconnect policy described by the transport configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut backoff = Self::new(
            Duration::from_secs(config.reconnect_delay),
            Duration::from_secs(config.reconnect_max_delay),
            config.reconnect_backoff_multiplier,
        );
        backoff.limit = match config.max_reconnect_attempts {
            0 => AttemptLimit::Unlimited,
            n => AttemptLimit::Fixed(n),
        };
        backoff
    }

    /// n = floor(log_multiplier(max / initial)) + 1
    fn calculate_max_attempts(initial: Duration, max: Duration, multiplier: f64) -> u32 {
        if initial >= max || multiplier <= 1.0 {
            return 1;
        }

        let n = (max.as_secs_f64() / initial.as_secs_f64()).log(multiplier);
        n.floor() as u32 + 1
    }

    /// Resets the delay and attempt counter after a successful connection.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the next sleep duration and advances the schedule.
    ///
    /// # Errors
    /// `BackoffError::MaxAttemptLimitError` once the attempt limit is exceeded.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt = self.attempt.saturating_add(1);

        match self.limit {
            AttemptLimit::Calculated(max) | AttemptLimit::Fixed(max) if self.attempt > max => {
                return Err(BackoffError::MaxAttemptLimitError(max));
            }
            _ => {}
        }

        let sleep = self.current_delay;
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.multiplier);
        self.current_delay = next.min(self.max_delay);

        Ok(sleep)
    }
}

impl Default for Backoff {
    /// 1s initial delay, 60s cap, 10% growth per attempt.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 1.1)
    }
}
