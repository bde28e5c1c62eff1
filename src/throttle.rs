use std::time::Duration;

use tokio::time::Instant;

/// Enforces a minimum spacing between model calls.
///
/// Spacing is measured from the moment the previous call was admitted.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: None,
        }
    }

    /// How long the next caller would have to wait right now.
    pub fn pending_delay(&self) -> Duration {
        match self.last_call {
            Some(last) => self.min_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Sleep until a call is allowed, then claim the slot.
    pub async fn acquire(&mut self) {
        let delay = self.pending_delay();
        if !delay.is_zero() {
            tracing::debug!(delay_ms = delay.as_millis() as u64, "rate limiting model call");
            tokio::time::sleep(delay).await;
        }
        self.last_call = Some(Instant::now());
    }
}
