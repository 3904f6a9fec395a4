//! Client coordinator configuration.

use std::time::Duration;

/// Timeout-ratio recycling: when the share of timeouts over a window gets
/// too high, the transport is assumed wedged and force-recycled even though
/// it is nominally open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Trip when `timeouts / requests` exceeds this over one window.
    pub ratio: f64,
    /// Window length between ratio checks.
    pub interval: Duration,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            ratio: 0.05,
            interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for a [`crate::Client`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Backoff between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Per-attempt deadline for a single request transmission.
    pub timeout: Duration,
    /// Maximum transmissions per request before it fails with `Timeout`.
    pub attempts: u32,
    /// When set, rotate the transport every interval (graceful drain).
    pub drain_interval: Option<Duration>,
    /// Timeout-ratio recycling; `None` disables the window check.
    pub tolerance: Option<Tolerance>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(10_000),
            attempts: 3,
            drain_interval: None,
            tolerance: Some(Tolerance::default()),
        }
    }
}

impl ClientOptions {
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = Some(interval);
        self
    }

    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn without_tolerance(mut self) -> Self {
        self.tolerance = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let options = ClientOptions::default();
        assert_eq!(options.reconnect_interval, Duration::from_millis(1000));
        assert_eq!(options.timeout, Duration::from_millis(10_000));
        assert_eq!(options.attempts, 3);
        assert_eq!(options.drain_interval, None);

        let tolerance = options.tolerance.unwrap();
        assert_eq!(tolerance.ratio, 0.05);
        assert_eq!(tolerance.interval, Duration::from_secs(10));
    }

    #[test]
    fn attempts_floor_at_one() {
        assert_eq!(ClientOptions::default().with_attempts(0).attempts, 1);
    }
}
