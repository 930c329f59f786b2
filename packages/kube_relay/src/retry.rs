//! Exponential backoff for restarting upstream streams.
//!
//! A [`Backoff`] hands out increasing delays between reconnect attempts and is
//! reset once a stream proves healthy again, so a long-lived stream that drops
//! occasionally always restarts quickly while a failing one backs off.

use rand::Rng;
use std::time::Duration;

/// Shape of the backoff curve.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Multiplier applied after every attempt
    pub multiplier: f64,
    /// Random spread added to each delay, as a fraction of it (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Backoff state for one retry loop
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt. Never exceeds `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.min(self.config.max_delay);
        self.attempts += 1;
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * jitter;
        let offset = rand::rng().random_range(0.0..=spread);
        Duration::from_secs_f64(base.as_secs_f64() + offset).min(self.config.max_delay)
    }

    /// Attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }
}
