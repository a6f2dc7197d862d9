use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Margin added to computed waits so the slot has really opened
const SLOT_MARGIN: Duration = Duration::from_millis(50);

/// Client-side sliding window shared by every clone of a client.
#[derive(Clone)]
pub(crate) struct SlidingWindow {
    sent: Arc<Mutex<VecDeque<Instant>>>,
    capacity: usize,
    window: Duration,
}

impl SlidingWindow {
    pub(crate) fn per_minute(capacity: usize) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    pub(crate) fn new(capacity: usize, window: Duration) -> Self {
        Self {
            sent: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            window,
        }
    }

    /// Wait for a free slot, then take it.
    pub(crate) async fn acquire(&self) {
        loop {
            let wait = {
                let mut sent = self.sent.lock().await;
                match reserve(&mut sent, self.capacity, self.window, Instant::now()) {
                    None => return,
                    Some(wait) => wait,
                }
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Polygon request slot busy");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Take a slot at `now` or report how long until the oldest one expires.
fn reserve(sent: &mut VecDeque<Instant>, capacity: usize, window: Duration, now: Instant) -> Option<Duration> {
    while sent
        .front()
        .is_some_and(|&at| now.saturating_duration_since(at) >= window)
    {
        sent.pop_front();
    }

    match sent.front() {
        Some(&oldest) if sent.len() >= capacity => {
            Some((oldest + window).saturating_duration_since(now) + SLOT_MARGIN)
        }
        _ => {
            sent.push_back(now);
            None
        }
    }
}
