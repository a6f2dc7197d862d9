use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Fixed-window request quota keyed by caller identity.
///
/// Each caller gets `limit` requests per `window`; the window starts at the
/// caller's first request and resets once it has fully elapsed.
pub struct QuotaLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, (Instant, u32)>,
}

/// Callers tracked before stale windows are swept
const SWEEP_THRESHOLD: usize = 1000;

impl QuotaLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    /// Take one unit of quota, or return how long until the window resets.
    pub fn check(&self, caller: &str) -> Result<(), Duration> {
        self.check_at(caller, Instant::now())
    }

    pub fn check_at(&self, caller: &str, now: Instant) -> Result<(), Duration> {
        if self.windows.len() > SWEEP_THRESHOLD {
            let window = self.window;
            self.windows
                .retain(|_, (start, _)| now.saturating_duration_since(*start) < window);
        }

        let mut entry = self.windows.entry(caller.to_string()).or_insert((now, 0));
        let (start, count) = entry.value_mut();

        let elapsed = now.saturating_duration_since(*start);
        if elapsed >= self.window {
            *start = now;
            *count = 1;
            Ok(())
        } else if *count >= self.limit {
            Err(self.window - elapsed)
        } else {
            *count += 1;
            Ok(())
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
