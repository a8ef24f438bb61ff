//! # Backoff Policy
//!
//! Computes the delay before retry attempt `n`. The same policy drives upstream
//! reconnects, downstream delivery retries and supervised unit restarts.
//!
//! The un-jittered delay grows exponentially and is clamped to the cap:
//! `raw(n) = min(cap, base * multiplier^n)`.
//!
//! Jitter is added on top of `raw(n)` but never crosses into the band of the
//! following attempt. It is drawn from `[0, min(jitter * raw(n), raw(n+1) - raw(n))]`,
//! which keeps `delay` non-decreasing in `n` and never above the cap. Once the
//! cap is reached the band is empty and every attempt waits exactly `cap`.
//!
//! With a seed, the jitter for attempt `n` comes from an RNG seeded with
//! `(seed, n)`, so `delay` is a pure function of the policy and the attempt.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential backoff with bounded jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    multiplier: f64,
    cap: Duration,
    jitter: f64,
    seed: Option<u64>,
}

impl BackoffPolicy {
    /// Creates a policy. Out-of-range inputs are clamped: `multiplier >= 1`,
    /// `0 <= jitter <= 1`, `cap >= base`.
    pub fn new(base: Duration, multiplier: f64, cap: Duration, jitter: f64, seed: Option<u64>) -> Self {
        let multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            base,
            multiplier,
            cap: cap.max(base),
            jitter,
            seed,
        }
    }

    /// A constant delay without jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, 1.0, delay, 0.0, None)
    }

    /// Returns the same policy with a fixed jitter seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The configured cap.
    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// The delay for `attempt` before jitter is applied.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_nanos() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let grown = base * self.multiplier.powi(exponent);

        if !grown.is_finite() || grown >= self.cap.as_nanos() as f64 {
            self.cap
        } else {
            Duration::from_nanos(grown.round() as u64).min(self.cap)
        }
    }

    /// The delay to wait before retry `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        let next = self.raw_delay(attempt.saturating_add(1));

        let band = next.saturating_sub(raw).min(raw.mul_f64(self.jitter));
        let band_nanos = u64::try_from(band.as_nanos()).unwrap_or(u64::MAX);
        if band_nanos == 0 {
            return raw;
        }

        let offset = match self.seed {
            Some(seed) => StdRng::seed_from_u64(mix(seed, attempt)).random_range(0..=band_nanos),
            None => rand::rng().random_range(0..=band_nanos),
        };

        raw + Duration::from_nanos(offset)
    }
}

fn mix(seed: u64, attempt: u32) -> u64 {
    seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
