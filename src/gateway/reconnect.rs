/// Client-side reconnect contract: exponential backoff with jitter, and a
/// non-retryable predicate keyed on the missing-token message.

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 30_000,
            jitter_ms: 1_000,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max) + jitter * random`, with `random` in
    /// `[0, 1)`.
    pub fn delay_ms(&self, attempt: u32, random: f64) -> u64 {
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = exp.min(self.max_ms);
        capped + (self.jitter_ms as f64 * random.clamp(0.0, 1.0)) as u64
    }

    pub fn next_delay(&self, attempt: u32) -> u64 {
        self.delay_ms(attempt, rand::random::<f64>())
    }
}

/// Errors naming a missing gateway token will never succeed on retry.
pub fn is_retryable(error_message: &str) -> bool {
    !error_message.contains("Missing gatewayToken")
}
