// Exponential backoff shared by the fetcher and the ingestor

use std::time::Duration;

/// Delay schedule: `base * 2^(retry - 1)`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Like [`delay`](Self::delay) but never shorter than a server-provided hint
    pub fn delay_with_hint(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let delay = self.delay(retry);
        match hint {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }
}
