//! Retry and timeout primitives for the replication session
//!
//! - [`ExponentialBackoff`] - delay between reconnect attempts
//! - [`ReadTimeoutBackoff`] - escalating read timeout for idle streams
//! - [`ReconnectPolicy`] - bounded or unlimited reconnect attempts

use std::time::Duration;

/// Exponential backoff calculator.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Get the next backoff duration
    pub fn next_backoff(&mut self) -> Duration {
        let backoff = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        backoff.min(self.max)
    }

    /// Reset the backoff
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Read timeout that doubles on every idle expiry.
///
/// An idle replication stream is normal, so an expired read is not an error
/// by itself. The timeout doubles after each expiry; once doubling would pass
/// the cap the connection is considered dead. Any received packet resets the
/// timeout to its baseline.
#[derive(Debug, Clone)]
pub struct ReadTimeoutBackoff {
    baseline: Duration,
    cap: Duration,
    current: Duration,
}

impl ReadTimeoutBackoff {
    pub fn new(baseline: Duration, cap: Duration) -> Self {
        let cap = cap.max(baseline);
        Self {
            baseline,
            cap,
            current: baseline,
        }
    }

    /// Timeout to apply to the next read.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record an expired read.
    ///
    /// Returns the next timeout, or `None` when the stream has been silent for
    /// longer than the cap allows.
    pub fn on_timeout(&mut self) -> Option<Duration> {
        if self.current >= self.cap {
            return None;
        }
        self.current = self.current.saturating_mul(2).min(self.cap);
        Some(self.current)
    }

    /// Data arrived; go back to the baseline.
    pub fn reset(&mut self) {
        self.current = self.baseline;
    }
}

/// How often a broken replication session may be re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum attempts; zero or negative means unlimited
    pub max_attempts: i32,
    /// Never reconnect
    pub disabled: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: i32, disabled: bool) -> Self {
        Self {
            max_attempts,
            disabled,
        }
    }

    /// Whether attempt number `attempt` (1-based) is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        if self.disabled {
            return false;
        }
        if self.max_attempts <= 0 {
            return true;
        }
        attempt <= self.max_attempts as u32
    }

    pub fn is_unlimited(&self) -> bool {
        !self.disabled && self.max_attempts <= 0
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(10, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(200));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(400));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff_max() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));

        for _ in 0..40 {
            let d = backoff.next_backoff();
            assert!(d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_read_timeout_doubles_until_cap() {
        let mut timeout = ReadTimeoutBackoff::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(timeout.current(), Duration::from_secs(1));
        assert_eq!(timeout.on_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(timeout.on_timeout(), Some(Duration::from_secs(4)));
        assert_eq!(timeout.on_timeout(), Some(Duration::from_secs(8)));
        assert_eq!(timeout.on_timeout(), None);
    }

    #[test]
    fn test_read_timeout_reset_on_data() {
        let mut timeout = ReadTimeoutBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        timeout.on_timeout();
        timeout.on_timeout();
        assert_eq!(timeout.current(), Duration::from_secs(4));
        timeout.reset();
        assert_eq!(timeout.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_read_timeout_cap_below_baseline() {
        let mut timeout = ReadTimeoutBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(timeout.current(), Duration::from_secs(5));
        assert_eq!(timeout.on_timeout(), None);
    }

    #[test]
    fn test_reconnect_policy() {
        let bounded = ReconnectPolicy::new(3, false);
        assert!(bounded.should_retry(1));
        assert!(bounded.should_retry(3));
        assert!(!bounded.should_retry(4));

        let unlimited = ReconnectPolicy::new(0, false);
        assert!(unlimited.is_unlimited());
        assert!(unlimited.should_retry(10_000));
        assert!(ReconnectPolicy::new(-1, false).should_retry(99));

        let disabled = ReconnectPolicy::new(0, true);
        assert!(!disabled.should_retry(1));
        assert!(!disabled.is_unlimited());
    }
}
