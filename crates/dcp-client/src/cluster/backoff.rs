//! Best-effort exponential backoff for session establishment.

use std::time::Duration;

/// Exponential backoff with deterministic jitter.
///
/// Delays grow by `multiplier` up to `max_delay`; jitter spreads retries by
/// ±25% of the current delay without pulling in a randomness source.
#[derive(Debug)]
pub(crate) struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    current_delay: Duration,
}

impl Backoff {
    /// Starts at 100 ms and caps at `max_delay`.
    pub(crate) fn new(max_delay: Duration) -> Self {
        let initial_delay = Duration::from_millis(100);
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            attempt: 0,
            current_delay: initial_delay,
        }
    }

    /// Retry attempts made so far.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// schedule.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let delay = self.current_delay;
        let jitter_range = delay.as_millis() as f64 * 0.25;
        let jitter_offset = (f64::from(self.attempt) * 7.0 % jitter_range.max(1.0))
            - (jitter_range / 2.0);
        let jittered_ms = (delay.as_millis() as f64 + jitter_offset).max(1.0);

        let next_ms = (self.current_delay.as_millis() as f64 * self.multiplier) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(self.max_delay);

        Duration::from_millis(jittered_ms as u64)
    }

    /// Resets after a successful attempt.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.initial_delay;
    }
}
