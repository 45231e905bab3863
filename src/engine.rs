//! Pure verdict function over a rule snapshot.
//!
//! `decide` sits on the per-connection hot path: no I/O, no side effects,
//! bounded constant work. The mode ordering encodes the product rule
//! "explicit trust beats a global block, explicit block beats a global
//! allow" — the asymmetry is intentional.

use serde::Serialize;

use crate::db;
use crate::rules::{RuleSnapshot, RuleStatus, Subject, Target};

/// Binary outcome of classifying one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Allow,
    Block,
}

/// Process-wide policy for traffic without an overriding explicit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FirewallMode {
    /// Block everything except Trust/Bypass rules.
    BlockAll,
    /// Allow everything except Block rules.
    AllowAll,
    /// Resolve per explicit rule; unclassified traffic falls through to the
    /// configured default.
    Custom,
}

/// A connection-attempt event as delivered by the packet-capture collaborator:
/// app identity, destination, and optional resolved metadata.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub subject: Subject,
    pub target: Target,
    /// Resolved hostname for a literal-IP target, when the capture layer
    /// observed the preceding DNS answer.
    pub hostname: Option<String>,
    /// Geo/network tag, e.g. a country flag code.
    pub tag: Option<String>,
    /// Event time, epoch ms.
    pub at_ms: i64,
}

impl ConnectionAttempt {
    pub fn new(subject: Subject, target: Target) -> Self {
        Self {
            subject,
            target,
            hostname: None,
            tag: None,
            at_ms: db::epoch_ms(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Classify one connection attempt against the given snapshot.
///
/// `allow_unclassified` is the caller-owned default for CUSTOM-mode traffic
/// that matches no rule; this function owns no policy state of its own.
pub fn decide(
    event: &ConnectionAttempt,
    mode: FirewallMode,
    snapshot: &RuleSnapshot,
    allow_unclassified: bool,
) -> Verdict {
    let status = snapshot.status_for(event.subject, &event.target.key());

    match mode {
        // Explicit trust always overrides a global block.
        FirewallMode::BlockAll => {
            if status.is_exempt() {
                Verdict::Allow
            } else {
                Verdict::Block
            }
        }
        // Explicit block always overrides a global allow.
        FirewallMode::AllowAll => {
            if status == RuleStatus::Block {
                Verdict::Block
            } else {
                Verdict::Allow
            }
        }
        FirewallMode::Custom => match status {
            RuleStatus::Block => Verdict::Block,
            RuleStatus::Trust | RuleStatus::BypassApp | RuleStatus::BypassUniversal => {
                Verdict::Allow
            }
            RuleStatus::None => {
                if allow_unclassified {
                    Verdict::Allow
                } else {
                    Verdict::Block
                }
            }
        },
    }
}
