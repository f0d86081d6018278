//! Exponential backoff with additive jitter.
//!
//! Two loops in the client back off exponentially:
//!
//! - the reconnect loop, `min(1000 ms · 2^(k-1), 30 s)` before attempt `k`;
//! - the command retry loop, `250 ms · 2^(k-1)` after failed attempt `k`.
//!
//! Both add up to 10 % random jitter on top of the computed delay, so a
//! fleet of clients that lost the gateway at the same moment does not
//! reconnect in lockstep.  Jitter is only ever added, never subtracted.

use std::time::Duration;

use rand::Rng;

/// Delay schedule `min(base · 2^(attempt-1), max) + jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the jitter as a fraction of the delay (0.1 = 10 %).
    ///
    /// Values outside `0.0..=1.0` are clamped; a non-finite value disables
    /// jitter.
    pub jitter_ratio: f64,
}

impl ExponentialBackoff {
    /// Schedule used between reconnect attempts.
    pub fn reconnect() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            jitter_ratio: 0.1,
        }
    }

    /// Schedule used between command retries.
    pub fn command_retry() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::MAX,
            jitter_ratio: 0.1,
        }
    }

    /// Delay before (1-based) attempt `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Delay before (1-based) attempt `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let ratio = self.effective_jitter();
        if ratio <= 0.0 {
            return base;
        }
        let factor = rand::rng().random_range(0.0..=ratio);
        base.saturating_add(base.mul_f64(factor))
    }

    /// `jitter_ratio` clamped to `0.0..=1.0`; `0.0` when not finite.
    pub fn effective_jitter(&self) -> f64 {
        if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Reconnect attempt bookkeeping.
///
/// The attempt counter is incremented *before* the delay is computed, and is
/// only reset by [`reset`](Self::reset) after a successful open.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    backoff: ExponentialBackoff,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(backoff: ExponentialBackoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts,
            attempts: 0,
        }
    }

    /// Advances the counter and returns the delay before the next attempt.
    ///
    /// Returns `None` once `max_attempts` attempts have been scheduled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.backoff.delay(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new(ExponentialBackoff::reconnect(), 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(mut backoff: ExponentialBackoff) -> ExponentialBackoff {
        backoff.jitter_ratio = 0.0;
        backoff
    }

    #[test]
    fn test_reconnect_sequence_doubles_until_cap() {
        let backoff = no_jitter(ExponentialBackoff::reconnect());

        let delays: Vec<u64> = (1..=7).map(|k| backoff.delay(k).as_millis() as u64).collect();

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn test_command_retry_sequence() {
        let backoff = no_jitter(ExponentialBackoff::command_retry());
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(2), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent_above_base() {
        let backoff = ExponentialBackoff::reconnect();
        for attempt in 1..=8 {
            let base = backoff.base_delay(attempt);
            for _ in 0..50 {
                let d = backoff.delay(attempt);
                assert!(d >= base, "jitter must never shorten the delay");
                assert!(d <= base.mul_f64(1.1), "jitter exceeded 10%: {d:?} vs {base:?}");
            }
        }
    }

    #[test]
    fn test_out_of_range_jitter_ratios_are_tamed() {
        let cases = [
            (f64::NAN, 0.0),
            (f64::INFINITY, 0.0),
            (-0.5, 0.0),
            (1e300, 1.0),
            (0.25, 0.25),
        ];
        for (ratio, expected) in cases {
            let backoff = ExponentialBackoff {
                jitter_ratio: ratio,
                ..ExponentialBackoff::command_retry()
            };
            assert_eq!(backoff.effective_jitter(), expected, "ratio {ratio}");

            for attempt in [1, 3, 40] {
                let base = backoff.base_delay(attempt);
                let d = backoff.delay(attempt);
                assert!(d >= base && d <= base.saturating_mul(2), "ratio {ratio}: {d:?}");
            }
        }
    }

    #[test]
    fn test_huge_attempt_numbers_do_not_overflow() {
        let backoff = no_jitter(ExponentialBackoff::reconnect());
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_reconnect_state_counts_then_exhausts() {
        // Arrange
        let mut state = ReconnectState::new(no_jitter(ExponentialBackoff::reconnect()), 3);

        // Act / Assert
        assert_eq!(state.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(state.attempts(), 1);
        assert_eq!(state.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(state.next_delay(), Some(Duration::from_millis(4000)));
        assert!(state.is_exhausted());
        assert_eq!(state.next_delay(), None);
        assert_eq!(state.attempts(), 3, "exhausted state must not keep counting");
    }

    #[test]
    fn test_reset_restarts_the_schedule() {
        let mut state = ReconnectState::new(no_jitter(ExponentialBackoff::reconnect()), 10);
        state.next_delay();
        state.next_delay();

        state.reset();

        assert_eq!(state.attempts(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_millis(1000)));
    }
}
