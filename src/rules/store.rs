//! Durable rule store with a copy-on-write in-memory snapshot.
//!
//! Reads on the decision hot path clone an `Arc` to the current snapshot and
//! never touch SQLite. Mutations are serialized, persisted first, then made
//! visible by swapping in a rebuilt snapshot.

use std::sync::{Arc, Mutex, RwLock};

use crate::db::Database;
use crate::error::CoreError;
use crate::rules::{Revision, RuleEntry, RuleSnapshot, RuleStatus, Subject, Target};

/// Owner of all rule records and the only writer to them.
pub struct RuleStore {
    db: Arc<Database>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    /// Serializes `set_rule` calls. Decision-path readers never take this;
    /// they only clone the snapshot pointer.
    write_lock: Mutex<()>,
}

impl RuleStore {
    /// Create a store with an empty snapshot. Call [`load`](Self::load) once
    /// at tunnel start before accepting connection-attempt events.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            snapshot: RwLock::new(Arc::new(RuleSnapshot::default())),
            write_lock: Mutex::new(()),
        }
    }

    /// Bulk-read all persisted rules into a fresh snapshot. Returns the
    /// number of rules loaded, or `StoreUnavailable` if the backing storage
    /// cannot be read — the caller then runs with no rules known and the
    /// configured default policy.
    pub fn load(&self) -> Result<usize, CoreError> {
        let rows = self
            .db
            .load_rules()
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;

        let mut snap = RuleSnapshot::default();
        for row in rows {
            let Some(status) = RuleStatus::from_code(row.status) else {
                tracing::warn!(
                    "Skipping rule ({}, {}) with unknown status code {}",
                    row.subject,
                    row.target,
                    row.status
                );
                continue;
            };
            snap.insert(
                Subject(row.subject),
                row.target,
                RuleEntry {
                    status,
                    revision: row.revision,
                },
            );
        }

        let count = snap.len();
        *self.snapshot.write().unwrap() = Arc::new(snap);
        tracing::info!("Rule store loaded: {count} rules");
        Ok(count)
    }

    /// Current immutable snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// O(1) effective-status lookup with precedence fallback. Always served
    /// from the in-memory snapshot, never from storage.
    pub fn get_status(&self, subject: Subject, target: &Target) -> RuleStatus {
        self.snapshot().status_for(subject, &target.key())
    }

    /// Revision of the exact rule at `(subject, target)`, if one exists.
    pub fn revision_of(&self, subject: Subject, target: &Target) -> Option<Revision> {
        self.snapshot().entry(subject, &target.key()).map(|e| e.revision)
    }

    /// Validate, persist durably, then atomically publish the change.
    /// Last-writer-wins per key; the returned revision increases by one for
    /// every accepted write to the same key.
    pub fn set_rule(
        &self,
        subject: Subject,
        target: &Target,
        status: RuleStatus,
    ) -> Result<Revision, CoreError> {
        validate_rule_key(subject, target)?;

        let _guard = self.write_lock.lock().unwrap();

        let key = target.key().into_owned();
        let current = self.snapshot.read().unwrap().clone();
        let revision = current.entry(subject, &key).map_or(1, |e| e.revision + 1);

        // Durable first; the snapshot only ever reflects persisted state.
        self.db
            .upsert_rule(subject.0, &key, status.code(), revision)
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let mut next = (*current).clone();
        next.insert(subject, key.clone(), RuleEntry { status, revision });
        *self.snapshot.write().unwrap() = Arc::new(next);

        tracing::debug!("Rule set: ({subject}, {key}) -> {status:?} rev {revision}");
        Ok(revision)
    }

    /// Drop the in-memory snapshot. Used on tunnel teardown; persisted rules
    /// are untouched and reappear on the next `load()`.
    pub fn unload_all(&self) {
        *self.snapshot.write().unwrap() = Arc::new(RuleSnapshot::default());
        tracing::debug!("Rule store unloaded");
    }
}

fn validate_rule_key(subject: Subject, target: &Target) -> Result<(), CoreError> {
    if subject.0 < 0 && !subject.is_any() {
        return Err(CoreError::InvalidRule(format!(
            "negative subject {} is not a valid app identity",
            subject.0
        )));
    }
    // Targets built through Target::parse are already well-formed; re-check
    // hand-constructed domains so a bad key never reaches storage.
    if let Target::Domain(d) = target {
        if Target::parse(d).is_err() {
            return Err(CoreError::InvalidRule(format!("malformed domain {d:?}")));
        }
    }
    Ok(())
}
