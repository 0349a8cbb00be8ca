//! Configuration for the session tracker.

use std::time::Duration;

/// Default interval between periodic flushes (10 minutes).
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(600);

/// Default number of background commits allowed to run at once.
pub const DEFAULT_MAX_INFLIGHT_FLUSHES: usize = 2;

/// Configuration for the session tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Interval between periodic flushes.
    pub flush_interval: Duration,

    /// Whether periodic flushes also persist open sessions.
    /// Closed sessions are always flushed.
    pub flush_open_sessions: bool,

    /// Upper bound on concurrently running background commits.
    /// Further flushes queue behind a permit.
    pub max_inflight_flushes: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_open_sessions: true,
            max_inflight_flushes: DEFAULT_MAX_INFLIGHT_FLUSHES,
        }
    }
}

impl TrackerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the periodic flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Enable or disable periodic flushing of open sessions.
    pub fn with_flush_open_sessions(mut self, enabled: bool) -> Self {
        self.flush_open_sessions = enabled;
        self
    }

    /// Set the background commit bound (at least one).
    pub fn with_max_inflight_flushes(mut self, max: usize) -> Self {
        self.max_inflight_flushes = max.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(600));
        assert!(config.flush_open_sessions);
        assert_eq!(config.max_inflight_flushes, 2);
    }

    #[test]
    fn test_inflight_bound_never_zero() {
        let config = TrackerConfig::new().with_max_inflight_flushes(0);
        assert_eq!(config.max_inflight_flushes, 1);
    }
}
