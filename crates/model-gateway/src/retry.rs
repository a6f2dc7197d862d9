use std::time::Duration;

use rand::Rng;

/// Exponential backoff with symmetric jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay added or removed at random (0.2 = ±20%)
    pub jitter: f64,
    /// Upper bound for any single wait, including provider retry-after hints
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1` (attempt is 0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with(attempt, unit)
    }

    /// Deterministic variant: `unit` in [-1, 1] scales the jitter.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let jittered = base * (1.0 + self.jitter * unit.clamp(-1.0, 1.0));
        if jittered.is_nan() || jittered <= 0.0 {
            return Duration::ZERO;
        }
        // Overflowing growth lands on the cap instead of a huge or infinite float
        if jittered >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(jittered).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Reject factors and jitter that would make the backoff meaningless.
    pub fn check(&self) -> Result<(), String> {
        if !self.factor.is_finite() || self.factor < 0.0 {
            return Err(format!("backoff factor must be finite and non-negative, got {}", self.factor));
        }
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("backoff jitter must be within [0, 1], got {}", self.jitter));
        }
        Ok(())
    }

    /// Wait for a provider-supplied retry-after, capped at `max_delay`.
    pub fn retry_after(&self, hint: Duration) -> Duration {
        hint.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected { actual - expected } else { expected - actual };
        assert!(diff < Duration::from_micros(1), "{:?} != {:?}", actual, expected);
    }

    #[test]
    fn test_exponential_growth() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_with(0, 0.0), Duration::from_millis(500));
        assert_eq!(policy.delay_with(1, 0.0), Duration::from_millis(1000));
        assert_eq!(policy.delay_with(2, 0.0), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        assert_close(policy.delay_with(0, 1.0), Duration::from_millis(600));
        assert_close(policy.delay_with(0, -1.0), Duration::from_millis(400));

        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_micros(799_999) && d <= Duration::from_micros(1_200_001));
        }
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_with(10, 0.0), Duration::from_secs(1));
        assert_eq!(policy.retry_after(Duration::from_secs(30)), Duration::from_secs(1));
    }

    #[test]
    fn test_runaway_growth_lands_on_cap() {
        let policy = RetryPolicy {
            max_retries: 2000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_with(1100, 0.0), policy.max_delay);
        assert_eq!(policy.delay_with(u32::MAX, 1.0), policy.max_delay);

        let huge_factor = RetryPolicy {
            factor: 1e300,
            ..RetryPolicy::default()
        };
        assert_eq!(huge_factor.delay_with(3, 0.0), huge_factor.max_delay);
    }

    #[test]
    fn test_check_rejects_bad_factor_and_jitter() {
        assert!(RetryPolicy::default().check().is_ok());
        assert!(RetryPolicy { factor: f64::INFINITY, ..RetryPolicy::default() }.check().is_err());
        assert!(RetryPolicy { factor: -2.0, ..RetryPolicy::default() }.check().is_err());
        assert!(RetryPolicy { jitter: f64::NAN, ..RetryPolicy::default() }.check().is_err());
        assert!(RetryPolicy { jitter: 1.5, ..RetryPolicy::default() }.check().is_err());
    }
}
