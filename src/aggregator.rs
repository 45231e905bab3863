//! Per-(subject, target) connection accounting using DashMap for lock-free
//! concurrent access.
//!
//! `record` is the hot path: an in-memory upsert only. Durability is eventual:
//! dirty entries are flushed to SQLite in batches by a background task, and a
//! periodic sweep deletes records past the retention window. An abrupt
//! process kill can lose the last few increments.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::db::{self, Database};
use crate::engine::{ConnectionAttempt, Verdict};
use crate::rules::Subject;

/// Running counters and metadata for one `(subject, target)` pair.
#[derive(Debug)]
struct ConnEntry {
    count: i64,
    last_seen_ms: i64,
    hostname: Option<String>,
    tag: Option<String>,
    /// Set by `record`, cleared once the value reaches storage.
    dirty: bool,
}

/// Snapshot of one connection record, serializable for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub subject: i64,
    pub target: String,
    /// Cumulative attempts observed. Monotonically non-decreasing while the
    /// record exists.
    pub count: i64,
    pub last_seen_ms: i64,
    pub hostname: Option<String>,
    pub tag: Option<String>,
}

/// Owner of all connection records and the only writer to them.
pub struct ConnectionAggregator {
    entries: DashMap<(i64, String), ConnEntry>,
    db: Arc<Database>,
}

impl ConnectionAggregator {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            entries: DashMap::new(),
            db,
        }
    }

    /// Re-populate counters from persisted rows so counts survive restarts.
    /// Returns the number of records loaded.
    pub fn warm_start(&self) -> anyhow::Result<usize> {
        let rows = self.db.load_connections()?;
        let count = rows.len();
        for row in rows {
            self.entries.insert(
                (row.subject, row.target.clone()),
                ConnEntry {
                    count: row.count,
                    last_seen_ms: row.last_seen_ms,
                    hostname: row.hostname,
                    tag: row.tag,
                    dirty: false,
                },
            );
        }
        tracing::info!("Connection aggregator warm-started with {count} records");
        Ok(count)
    }

    /// Upsert the record for the event's pair: increment the count, refresh
    /// `last_seen_ms`, keep the freshest metadata. Never blocks on storage.
    pub fn record(&self, event: &ConnectionAttempt, verdict: Verdict) {
        tracing::trace!(
            "conn {} -> {} verdict {verdict:?}",
            event.subject,
            event.target
        );

        let key = (event.subject.0, event.target.key().into_owned());
        self.entries
            .entry(key)
            .and_modify(|e| {
                e.count += 1;
                e.last_seen_ms = e.last_seen_ms.max(event.at_ms);
                if event.hostname.is_some() {
                    e.hostname = event.hostname.clone();
                }
                if event.tag.is_some() {
                    e.tag = event.tag.clone();
                }
                e.dirty = true;
            })
            .or_insert_with(|| ConnEntry {
                count: 1,
                last_seen_ms: event.at_ms,
                hostname: event.hostname.clone(),
                tag: event.tag.clone(),
                dirty: true,
            });
    }

    /// All records for a subject, ordered by count descending then
    /// last-seen descending. Recomputed per call; not a live view.
    pub fn snapshot_for(&self, subject: Subject) -> Vec<ConnectionRecord> {
        let mut records: Vec<ConnectionRecord> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == subject.0)
            .map(|entry| {
                let (subj, target) = entry.key();
                let e = entry.value();
                ConnectionRecord {
                    subject: *subj,
                    target: target.clone(),
                    count: e.count,
                    last_seen_ms: e.last_seen_ms,
                    hostname: e.hostname.clone(),
                    tag: e.tag.clone(),
                }
            })
            .collect();

        records.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.last_seen_ms.cmp(&a.last_seen_ms))
        });
        records
    }

    /// Delete records whose `last_seen_ms` predates the cutoff, in memory and
    /// in storage. Invoked by the periodic scheduler, never inline with
    /// `record`. Returns the number of rows deleted from storage.
    pub fn prune(&self, older_than: Duration) -> anyhow::Result<usize> {
        let cutoff = db::epoch_ms() - older_than.as_millis() as i64;
        self.entries.retain(|_, e| e.last_seen_ms >= cutoff);
        self.db.prune_connections(cutoff)
    }

    /// Write all dirty entries to storage in one batch. Entries that take
    /// further increments during a failed flush stay dirty and are retried
    /// on the next tick. Returns the number of records flushed.
    pub fn flush(&self) -> anyhow::Result<usize> {
        let pending: Vec<ConnectionRecord> = self
            .entries
            .iter()
            .filter(|entry| entry.value().dirty)
            .map(|entry| {
                let (subj, target) = entry.key();
                let e = entry.value();
                ConnectionRecord {
                    subject: *subj,
                    target: target.clone(),
                    count: e.count,
                    last_seen_ms: e.last_seen_ms,
                    hostname: e.hostname.clone(),
                    tag: e.tag.clone(),
                }
            })
            .collect();

        if pending.is_empty() {
            return Ok(0);
        }

        self.db.upsert_connection_batch(&pending)?;

        // Only clear entries whose flushed count is still current; a racing
        // record() keeps them dirty for the next flush.
        for rec in &pending {
            if let Some(mut entry) = self.entries.get_mut(&(rec.subject, rec.target.clone())) {
                if entry.count == rec.count {
                    entry.dirty = false;
                }
            }
        }
        Ok(pending.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_memory_db;
    use crate::rules::Target;

    fn aggregator() -> ConnectionAggregator {
        ConnectionAggregator::new(Arc::new(open_memory_db()))
    }

    fn attempt(subject: i64, target: &str) -> ConnectionAttempt {
        ConnectionAttempt::new(Subject(subject), Target::parse(target).unwrap())
    }

    #[test]
    fn test_record_count_is_monotonic() {
        let agg = aggregator();
        for _ in 0..5 {
            agg.record(&attempt(2002, "example.com"), Verdict::Allow);
        }

        let records = agg.snapshot_for(Subject(2002));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 5);
        assert_eq!(records[0].target, "example.com");
    }

    #[test]
    fn test_record_keeps_freshest_metadata() {
        let agg = aggregator();
        agg.record(&attempt(1, "93.184.216.34"), Verdict::Allow);
        agg.record(
            &attempt(1, "93.184.216.34")
                .with_hostname("example.com")
                .with_tag("US"),
            Verdict::Allow,
        );
        // A later event without metadata does not erase what we know.
        agg.record(&attempt(1, "93.184.216.34"), Verdict::Block);

        let records = agg.snapshot_for(Subject(1));
        assert_eq!(records[0].count, 3);
        assert_eq!(records[0].hostname.as_deref(), Some("example.com"));
        assert_eq!(records[0].tag.as_deref(), Some("US"));
    }

    #[test]
    fn test_snapshot_for_orders_by_count_then_recency() {
        let agg = aggregator();
        for _ in 0..3 {
            agg.record(&attempt(1, "busy.example.com"), Verdict::Allow);
        }
        agg.record(&attempt(1, "quiet.example.com"), Verdict::Allow);

        let mut old = attempt(1, "older.example.com");
        old.at_ms = 1;
        agg.record(&old, Verdict::Allow);

        // Unrelated subject must not appear.
        agg.record(&attempt(2, "other.example.com"), Verdict::Allow);

        let records = agg.snapshot_for(Subject(1));
        let targets: Vec<&str> = records.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(
            targets,
            vec!["busy.example.com", "quiet.example.com", "older.example.com"]
        );
    }

    #[test]
    fn test_snapshot_for_unknown_subject_is_empty() {
        let agg = aggregator();
        agg.record(&attempt(1, "example.com"), Verdict::Allow);
        assert!(agg.snapshot_for(Subject(999)).is_empty());
    }

    #[test]
    fn test_flush_then_warm_start_round_trip() {
        let db = Arc::new(open_memory_db());
        let agg = ConnectionAggregator::new(Arc::clone(&db));

        for _ in 0..4 {
            agg.record(&attempt(2002, "example.com"), Verdict::Allow);
        }
        assert_eq!(agg.flush().unwrap(), 1);
        // Nothing dirty after a clean flush.
        assert_eq!(agg.flush().unwrap(), 0);

        let restarted = ConnectionAggregator::new(db);
        assert_eq!(restarted.warm_start().unwrap(), 1);
        let records = restarted.snapshot_for(Subject(2002));
        assert_eq!(records[0].count, 4);
    }

    #[test]
    fn test_prune_removes_stale_records_only() {
        let agg = aggregator();

        let mut stale = attempt(1, "stale.example.com");
        stale.at_ms = 1000; // far past
        agg.record(&stale, Verdict::Allow);
        agg.record(&attempt(1, "fresh.example.com"), Verdict::Allow);
        agg.flush().unwrap();

        agg.prune(Duration::from_secs(60)).unwrap();

        let records = agg.snapshot_for(Subject(1));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "fresh.example.com");
    }

    #[test]
    fn test_record_serializes_for_presentation() {
        let agg = aggregator();
        agg.record(
            &attempt(1, "93.184.216.34").with_hostname("example.com"),
            Verdict::Allow,
        );

        let records = agg.snapshot_for(Subject(1));
        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["subject"], 1);
        assert_eq!(json["target"], "93.184.216.34");
        assert_eq!(json["count"], 1);
        assert_eq!(json["hostname"], "example.com");
        assert!(json["tag"].is_null());
    }

    #[test]
    fn test_record_after_prune_restarts_count() {
        let agg = aggregator();
        let mut stale = attempt(1, "example.com");
        stale.at_ms = 1000;
        agg.record(&stale, Verdict::Allow);
        agg.prune(Duration::from_secs(60)).unwrap();

        agg.record(&attempt(1, "example.com"), Verdict::Allow);
        assert_eq!(agg.snapshot_for(Subject(1))[0].count, 1);
    }
}
