//! Jittered exponential backoff and the sleep seam used by the executor.

use std::thread;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the nominal delay.
    pub cap: Duration,
    /// Jitter fraction `j`; the nominal delay is scaled by a factor in `[1-j, 1+j]`.
    pub jitter: f64,
    /// Minimum delay after jitter.
    pub floor: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(60),
            jitter: 0.3,
            floor: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    /// `min(cap, base * 2^retry)` before jitter; `retry` counts from zero.
    pub fn nominal(&self, retry: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * 2f64.powi(retry.min(1023) as i32);
        let capped = scaled.min(self.cap.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay for `retry`, drawn from `rng` and clamped to the floor.
    pub fn delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(retry).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        Duration::from_secs_f64(nominal * factor).max(self.floor)
    }
}

/// Per-task backoff state; each call to [`Backoff::next_delay`] grows the delay.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    retries: u32,
}

impl Backoff {
    /// Fresh state for one task.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Retries taken so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay for the next retry.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = self.policy.delay(self.retries, rng);
        self.retries = self.retries.saturating_add(1);
        delay
    }
}

/// Blocks the caller for a duration. Tests substitute a recorder.
pub trait Sleeper {
    /// Sleeps for `duration`.
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn nominal_delays_double_until_capped() {
        let policy = BackoffPolicy::default();
        let nominal: Vec<u64> = (0..8).map(|n| policy.nominal(n).as_secs()).collect();
        assert_eq!(nominal, vec![2, 4, 8, 16, 32, 60, 60, 60]);
        assert!(nominal.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(policy.nominal(u32::MAX), policy.cap);
    }

    #[test]
    fn jittered_delays_stay_in_bounds() {
        let policy = BackoffPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::new(policy);
        for retry in 0..20 {
            let delay = backoff.next_delay(&mut rng).as_secs_f64();
            let nominal = policy.nominal(retry).as_secs_f64();
            let low = (nominal * (1.0 - policy.jitter)).max(policy.floor.as_secs_f64());
            let high = policy.cap.as_secs_f64() * (1.0 + policy.jitter);
            assert!(
                delay >= low - 1e-9 && delay <= high + 1e-9,
                "retry {retry}: {delay} outside [{low}, {high}]"
            );
        }
        assert_eq!(backoff.retries(), 20);
    }

    #[test]
    fn floor_applies_to_tiny_bases() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(10),
            jitter: 0.0,
            floor: Duration::from_millis(500),
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay(0, &mut rng), Duration::from_millis(500));
    }
}
