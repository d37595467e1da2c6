//! Exponential backoff for chunk retransmission (§4.10 "Reliability"):
//! base 1s, factor 1.5, capped at 60s, at most `max_retries` attempts.

use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    max_retries: u32,
}

impl Backoff {
    pub fn new(max_retries: u32) -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 1.5,
            cap: Duration::from_secs(60),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry attempt `attempt` (1-indexed: the first retry
    /// is `attempt == 1`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }
}
