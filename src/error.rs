//! Unified error type for the firewall core.
//!
//! `CoreError` is the single error type surfaced across component boundaries.
//! Each variant maps to a distinct failure domain from the error-handling
//! design: load failures, rejected rule writes, tunnel state-machine misuse,
//! establishment failures, and non-fatal storage errors.

use crate::tunnel::TunnelState;

/// Core-level error returned by the rule store, tunnel controller, and
/// aggregator maintenance paths.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The backing rule storage could not be read during `load()`.
    /// The caller treats this as "no rules known" and applies the configured
    /// default policy for unclassified traffic.
    #[error("rule store unavailable: {0}")]
    StoreUnavailable(String),

    /// A malformed `(subject, target)` pair was passed to `set_rule`.
    /// Nothing is written.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// A tunnel transition was requested from a state that does not permit
    /// it. Recovered locally; the session state is unchanged.
    #[error("invalid transition: {op}() while {from:?}")]
    InvalidTransition {
        from: TunnelState,
        op: &'static str,
    },

    /// Tunnel establishment failed or timed out. Not retried internally;
    /// the caller decides whether to create a new session and start again.
    #[error("tunnel start failed: {0}")]
    TunnelStartFailed(String),

    /// Durable storage failed outside the load path (rule persist, flush,
    /// prune). Flush failures are degradation, never fatal.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::StoreUnavailable(_) => "StoreUnavailable",
            CoreError::InvalidRule(_) => "InvalidRule",
            CoreError::InvalidTransition { .. } => "InvalidTransition",
            CoreError::TunnelStartFailed(_) => "TunnelStartFailed",
            CoreError::Storage(_) => "Storage",
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}
