use std::time::Duration;

/// Bounded exponential backoff shared by the request client and resource sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    /// Total attempts allowed, including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow `attempts_used` failed ones.
    pub fn allows_another(&self, attempts_used: u32) -> bool {
        attempts_used < self.max_attempts
    }

    /// Delay before retry number `attempt + 1`: 1x, 2x, 4x ... the base.
    ///
    /// A server `Retry-After` hint can only lengthen the wait, and the result
    /// never exceeds the configured maximum.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let scheduled = self.base_delay_ms.saturating_mul(1_u64 << attempt.min(20));
        let wait = retry_after_hint_ms.map_or(scheduled, |hint| scheduled.max(hint));
        Duration::from_millis(wait.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000, 3)
    }
}
