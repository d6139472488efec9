//! Reconnect backoff
//!
//! Exponential delays doubling from `base` up to `cap`, with relative
//! jitter so many clients dropped by the same outage do not reconnect in
//! lockstep.

use rand::Rng;
use std::time::Duration;

use crate::shared::config::BackoffConfig;

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Forget past failures after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Un-jittered delay for the given 1-based attempt
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.config
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.config.cap)
    }

    /// Delay before the next reconnect attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.base_delay(self.attempt);
        let jitter = self.config.jitter;
        if jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(factor).min(self.config.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter,
        }
    }

    #[test]
    fn test_doubles_up_to_cap() {
        let backoff = Backoff::new(config(0.0));
        assert_eq!(backoff.base_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(2), Duration::from_secs(2));
        assert_eq!(backoff.base_delay(5), Duration::from_secs(16));
        assert_eq!(backoff.base_delay(6), Duration::from_secs(30));
        assert_eq!(backoff.base_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(config(0.2));
        for attempt in 1..=8 {
            let delay = backoff.next_delay();
            let base = backoff.base_delay(attempt);
            assert!(delay >= base.mul_f64(0.8), "attempt {}: {:?}", attempt, delay);
            assert!(delay <= base.mul_f64(1.2).min(Duration::from_secs(30)));
        }
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(config(0.0));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
