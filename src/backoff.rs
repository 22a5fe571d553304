//! # Reconnect backoff policy.
//!
//! [`BackoffPolicy`] controls how the delay between reconnect attempts grows
//! after repeated failures. The delay for attempt `n` is `first × factor^n`,
//! clamped to `max`, with optional [`Jitter`] applied afterwards. The base
//! delay is derived purely from the attempt number, so jitter output never
//! feeds back into later calculations.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Randomization applied to a computed backoff delay.
///
/// Prevents synchronized reconnect storms when many clients lose the same
/// broker at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Use the exact computed delay.
    #[default]
    None,
    /// Random delay in `[0, delay]`.
    Full,
    /// `delay/2 + random[0, delay/2]`; balanced, recommended for fleets.
    Equal,
}

impl Jitter {
    /// Applies this jitter to the given delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=ms)),
            Jitter::Equal => {
                let half = ms / 2;
                let jitter = if half == 0 {
                    0
                } else {
                    rng.random_range(0..=half)
                };
                Duration::from_millis(half + jitter)
            }
        }
    }
}

/// Delay policy between reconnect attempts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Randomization strategy.
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    /// Constant 1s delay, capped at 30s, no jitter — the original
    /// fixed reconnect interval of the eventbus client.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 1.0,
            jitter: Jitter::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given attempt number (0-indexed).
    ///
    /// The base is `first × factor^attempt`, clamped to `max`; jitter is
    /// applied to the clamped base.
    pub fn next(&self, attempt: u32) -> Duration {
        let growth = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let ms = self.first.as_secs_f64() * 1000.0 * growth;

        // Anything non-finite or negative (overflowing growth, bad factor)
        // lands on the cap; the cast saturates for the rest.
        let base = if ms.is_finite() && ms >= 0.0 {
            Duration::from_millis(ms as u64).min(self.max)
        } else {
            self.max
        };

        self.jitter.apply(base)
    }
}
