//! Capped exponential backoff with jitter for reconnect attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Exponent cap; past this the ceiling always wins anyway.
const MAX_EXPONENT: u32 = 16;

/// Retry delay calculator. Attempts are unbounded.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_delay(),
            max: config.max_delay(),
            jitter: config.jitter(),
            attempt: 0,
        }
    }

    /// Consecutive failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failure and return how long to wait before the next attempt.
    ///
    /// `min(base * 2^attempt + U(0, jitter), max)`
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(MAX_EXPONENT)));
        self.attempt = self.attempt.saturating_add(1);
        exp.saturating_add(self.sample_jitter()).min(self.max)
    }

    /// Forget past failures after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
