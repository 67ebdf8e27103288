//! Reconnect scheduling.
//!
//! Exponential backoff with jitter:
//! ```text
//! below the ceiling:  delay(n) = clamp(jitter(base · 2ⁿ), floor, ceiling · (1 - j))
//! at the ceiling:     delay(n) ∈ [ceiling · (1 - j), ceiling]
//! ```
//! and a single-slot timer owned by the connection driver. Arming the timer
//! replaces any earlier deadline; tokens from superseded schedules never fire.
//!
//! Delays below the ceiling are capped at the bottom of the ceiling band, so
//! the sequence never shrinks until it reaches that band; from then on every
//! attempt draws a fresh delay inside it.

use std::future::pending;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep_until, Instant};

/// Reconnect delay policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (attempt 0)
    pub base: Duration,
    /// Largest delay ever returned
    pub ceiling: Duration,
    /// Smallest delay ever returned
    pub floor: Duration,
    /// Relative jitter, e.g. 0.15 for ±15 %
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            floor: Duration::from_millis(250),
            jitter: 0.15,
        }
    }
}

impl BackoffPolicy {
    /// Undisturbed delay for `attempt`.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    /// Randomized delay for `attempt`.
    ///
    /// Non-decreasing in `attempt` up to the ceiling band for any jitter up to
    /// one third.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let spread = self.jitter.clamp(0.0, 1.0);
        let band_low = self.ceiling.mul_f64(1.0 - spread);
        let nominal = self.nominal(attempt);
        if nominal >= self.ceiling {
            let factor = if spread > 0.0 {
                rng.gen_range(1.0 - spread..=1.0)
            } else {
                1.0
            };
            return self.ceiling.mul_f64(factor).max(self.floor).min(self.ceiling);
        }
        let factor = if spread > 0.0 {
            rng.gen_range(1.0 - spread..=1.0 + spread)
        } else {
            1.0
        };
        nominal
            .mul_f64(factor)
            .min(band_low)
            .max(self.floor)
            .min(self.ceiling)
    }
}

/// Identifies one arming of a [`ReconnectTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

/// Single-slot cancellable timer.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    generation: u64,
    deadline: Option<(Instant, TimerToken)>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer `delay` from now, superseding any earlier deadline.
    pub fn schedule(&mut self, delay: Duration) -> TimerToken {
        self.generation += 1;
        let token = TimerToken(self.generation);
        self.deadline = Some((Instant::now() + delay, token));
        token
    }

    /// Disarm. Outstanding tokens become stale.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left before the deadline, if armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()))
    }

    /// Resolve when the current deadline passes. Pending forever when disarmed.
    ///
    /// Cancel-safe: dropping the future leaves the timer untouched.
    pub async fn wait(&self) -> TimerToken {
        match self.deadline {
            Some((at, token)) => {
                sleep_until(at).await;
                token
            }
            None => pending().await,
        }
    }

    /// Consume the deadline if `token` is still current.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        match self.deadline {
            Some((_, current)) if current == token => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
