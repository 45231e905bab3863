//! Runtime configuration for the firewall core.
//!
//! All tunable intervals, timeouts, and policy defaults are collected here so
//! they can be found and adjusted in a single place rather than scattered
//! across modules. Components receive an explicit [`CoreConfig`] at
//! construction; there is no global configuration singleton.

use std::time::Duration;

/// Interval at which dirty aggregator entries are flushed to SQLite (seconds).
pub const FLUSH_INTERVAL_SECS: u64 = 5;

/// Interval at which stale connection records are pruned (seconds).
pub const PRUNE_INTERVAL_SECS: u64 = 3600;

/// Maximum age of a connection record before the periodic sweep deletes it (days).
pub const RETENTION_DAYS: u64 = 7;

/// Bound on the external wait for tunnel establishment inside `start()` (seconds).
pub const START_TIMEOUT_SECS: u64 = 30;

/// Reconnect attempts after the underlying network set becomes empty.
/// The first retry is mandatory; the rest are policy.
pub const RECONNECT_MAX_RETRIES: u32 = 3;

/// Initial delay between reconnect attempts (milliseconds). Doubles per attempt.
pub const RECONNECT_BACKOFF_MS: u64 = 500;

/// Process-wide configuration handed to each component at tunnel start and
/// torn down at tunnel stop.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Verdict for unclassified traffic in CUSTOM mode, and the fail-safe
    /// policy when the rule store cannot be loaded. `true` means fail open
    /// (ALLOW), the documented default.
    pub allow_unclassified: bool,
    /// Bound on tunnel establishment inside `start()`; expiry transitions
    /// the session to FAILED.
    pub start_timeout: Duration,
    /// Reconnect attempts before giving up and transitioning to FAILED.
    /// Clamped to at least 1.
    pub reconnect_max_retries: u32,
    /// Initial reconnect backoff; doubled after each failed attempt.
    pub reconnect_backoff: Duration,
    /// Connection records older than this are deleted by the periodic sweep.
    pub retention: Duration,
    /// Cadence of the aggregator flush task.
    pub flush_interval: Duration,
    /// Cadence of the prune task.
    pub prune_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            allow_unclassified: true,
            start_timeout: Duration::from_secs(START_TIMEOUT_SECS),
            reconnect_max_retries: RECONNECT_MAX_RETRIES,
            reconnect_backoff: Duration::from_millis(RECONNECT_BACKOFF_MS),
            retention: Duration::from_secs(RETENTION_DAYS * 86400),
            flush_interval: Duration::from_secs(FLUSH_INTERVAL_SECS),
            prune_interval: Duration::from_secs(PRUNE_INTERVAL_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fails_open() {
        assert!(CoreConfig::default().allow_unclassified);
    }

    #[test]
    fn test_default_requires_at_least_one_retry() {
        assert!(CoreConfig::default().reconnect_max_retries >= 1);
    }

    /// Compile-time sanity: all constants are positive.
    #[test]
    fn test_all_intervals_positive() {
        const _: () = assert!(FLUSH_INTERVAL_SECS > 0);
        const _: () = assert!(PRUNE_INTERVAL_SECS > 0);
        const _: () = assert!(RETENTION_DAYS > 0);
        const _: () = assert!(START_TIMEOUT_SECS > 0);
        const _: () = assert!(RECONNECT_MAX_RETRIES >= 1);
        const _: () = assert!(RECONNECT_BACKOFF_MS > 0);
    }
}
