//! Rule model: subjects, targets, statuses, and the immutable lookup snapshot.
//!
//! A rule is keyed by `(subject, target)` where the subject is an OS-assigned
//! numeric app identity and the target is a literal IP, a domain name, or the
//! universal sentinel. Lookups fall through a fixed precedence order:
//! exact pair, then `(subject, ANY)`, then `(ANY, target)`, then
//! `(ANY, ANY)`, then no rule.

pub mod store;

pub use store::RuleStore;

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

use crate::error::CoreError;

/// OS-assigned numeric identity of the application whose traffic is being
/// classified, or [`Subject::ANY`] meaning all applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Subject(pub i64);

impl Subject {
    /// Universal sentinel: the rule applies to every application.
    pub const ANY: Subject = Subject(-1);

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Destination of a connection attempt: a literal address, a domain name, or
/// the universal sentinel meaning all destinations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Any,
    Ip(IpAddr),
    Domain(String),
}

impl Target {
    /// Parse a raw target string. IP literals win over hostnames; `*` is the
    /// universal sentinel. Rejects empty or malformed input with
    /// [`CoreError::InvalidRule`].
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::InvalidRule("empty target".into()));
        }
        if raw == "*" {
            return Ok(Target::Any);
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Ok(Target::Ip(ip));
        }
        if is_valid_hostname(raw) {
            return Ok(Target::Domain(raw.to_ascii_lowercase()));
        }
        Err(CoreError::InvalidRule(format!(
            "target is neither an IP address nor a hostname: {raw:?}"
        )))
    }

    /// Normalized string key used for snapshot lookup and persistence.
    pub fn key(&self) -> Cow<'_, str> {
        match self {
            Target::Any => Cow::Borrowed("*"),
            Target::Ip(ip) => Cow::Owned(ip.to_string()),
            Target::Domain(d) => Cow::Borrowed(d),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Target::Any)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Hostname check per RFC 1123 label rules, with underscores tolerated
/// (seen in the wild for SRV-style names).
fn is_valid_hostname(s: &str) -> bool {
    if s.is_empty() || s.len() > 253 {
        return false;
    }
    s.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// Ruling attached to a `(subject, target)` pair.
///
/// `Block` and the allow-side statuses are mutually exclusive per key; a write
/// replaces whatever status previously existed at that exact key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleStatus {
    /// No explicit rule. Stored `None` entries behave as if absent: lookup
    /// falls through to the next precedence level.
    None,
    Block,
    /// Force-allow, bypassing blocklists and a global BLOCK_ALL mode.
    Trust,
    /// App exempted from the tunnel's blocking policy.
    BypassApp,
    /// Target exempted for all apps.
    BypassUniversal,
}

impl RuleStatus {
    /// Integer code used in the persisted schema.
    pub fn code(self) -> i64 {
        match self {
            RuleStatus::None => 0,
            RuleStatus::Block => 1,
            RuleStatus::Trust => 2,
            RuleStatus::BypassApp => 3,
            RuleStatus::BypassUniversal => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RuleStatus::None),
            1 => Some(RuleStatus::Block),
            2 => Some(RuleStatus::Trust),
            3 => Some(RuleStatus::BypassApp),
            4 => Some(RuleStatus::BypassUniversal),
            _ => None,
        }
    }

    /// Trust and both bypass statuses override a global block.
    pub fn is_exempt(self) -> bool {
        matches!(
            self,
            RuleStatus::Trust | RuleStatus::BypassApp | RuleStatus::BypassUniversal
        )
    }
}

/// Per-key mutation counter, monotonically increasing, used to detect stale
/// writes. The first write to a key gets revision 1.
pub type Revision = i64;

/// Status plus revision for one `(subject, target)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleEntry {
    pub status: RuleStatus,
    pub revision: Revision,
}

/// Immutable in-memory view of all rules. Built once by `load()`, rebuilt and
/// atomically swapped in on every mutation; readers on the decision hot path
/// only ever see a consistent snapshot and never block on a writer.
#[derive(Debug, Default, Clone)]
pub struct RuleSnapshot {
    by_subject: HashMap<i64, HashMap<String, RuleEntry>>,
    len: usize,
}

impl RuleSnapshot {
    pub fn insert(&mut self, subject: Subject, target_key: String, entry: RuleEntry) {
        let prev = self
            .by_subject
            .entry(subject.0)
            .or_default()
            .insert(target_key, entry);
        if prev.is_none() {
            self.len += 1;
        }
    }

    /// Exact-key lookup, no precedence fallback.
    pub fn entry(&self, subject: Subject, target_key: &str) -> Option<RuleEntry> {
        self.by_subject
            .get(&subject.0)
            .and_then(|targets| targets.get(target_key))
            .copied()
    }

    /// Resolve the effective status for a pair, most specific first:
    /// exact `(subject, target)`, then `(subject, ANY)`, then `(ANY, target)`,
    /// then the global `(ANY, ANY)` rule, then `None`. Stored `None` entries
    /// fall through.
    pub fn status_for(&self, subject: Subject, target_key: &str) -> RuleStatus {
        let lookups = [
            (subject, target_key),
            (subject, "*"),
            (Subject::ANY, target_key),
            (Subject::ANY, "*"),
        ];
        for (s, t) in lookups {
            if let Some(entry) = self.entry(s, t) {
                if entry.status != RuleStatus::None {
                    return entry.status;
                }
            }
        }
        RuleStatus::None
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
