//! Bounded retry budget with exponential backoff
//!
//! The client keeps two independent budgets: one for the signaling channel and
//! one for the peer session. Each is reset on its own successful
//! (re)connection and, once exhausted, stays exhausted until reset.

use std::time::Duration;

use crate::config::RetryConfig;

/// Retry counter plus the delay policy that goes with it
#[derive(Clone, Debug)]
pub struct RetryBudget {
    attempts: u32,
    max: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryBudget {
    pub fn new(max: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    /// Attempts recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    /// Record one more attempt. Returns the new attempt number, or `None` if
    /// the budget was already spent (the counter never exceeds `max`).
    pub fn record_attempt(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Delay before the current attempt: `min(base * 2^(attempts-1), max_delay)`
    pub fn backoff_delay(&self) -> Duration {
        let exponent = self.attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Record an attempt and return its backoff delay in one step
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.record_attempt()?;
        Some(self.backoff_delay())
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> RetryBudget {
        RetryBudget::new(5, Duration::from_millis(100), Duration::from_millis(1000))
    }

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let mut b = budget();
        let delays: Vec<u64> = std::iter::from_fn(|| b.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    }

    #[test]
    fn test_counter_never_exceeds_max() {
        let mut b = budget();
        for _ in 0..20 {
            b.record_attempt();
        }
        assert_eq!(b.attempts(), 5);
        assert!(b.is_exhausted());
        assert!(b.next_delay().is_none());
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut b = budget();
        while b.record_attempt().is_some() {}
        b.reset();

        assert_eq!(b.attempts(), 0);
        assert!(!b.is_exhausted());
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_budget_is_exhausted() {
        let mut b = RetryBudget::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert!(b.is_exhausted());
        assert!(b.record_attempt().is_none());
    }

    #[test]
    fn test_large_attempt_counts_saturate() {
        let mut b = RetryBudget::new(100, Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..60 {
            b.record_attempt();
        }
        assert_eq!(b.backoff_delay(), Duration::from_secs(30));
    }
}
