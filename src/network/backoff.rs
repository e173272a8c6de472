use std::time::Duration;

/// Exponential reconnect delay with a cap and no attempt limit
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Backoff {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Counts one more attempt and returns the delay to wait before it:
    /// `min(base * 2^(attempt - 1), cap)`
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = 2u32.checked_pow(self.attempt - 1);
        factor
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Current attempt number, zero while connected
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Called once a session authenticates
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
