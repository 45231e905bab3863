//! SQLite persistence for firewall rules and the connection log.
//!
//! Uses `rusqlite` with bundled SQLite. Handles:
//! - Durable `(subject, target)` rule rows with per-key revisions
//! - Per-destination connection counters flushed in batches
//! - Pruning of connection rows past the retention window

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::aggregator::ConnectionRecord;

/// Manages the SQLite database backing the rule store and the aggregator.
pub struct Database {
    conn: Mutex<Connection>,
}

/// One persisted rule row, exactly as stored.
#[derive(Debug, Clone)]
pub struct PersistedRule {
    pub subject: i64,
    pub target: String,
    pub status: i64,
    pub revision: i64,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS ip_rules (
        subject  INTEGER NOT NULL,
        target   TEXT NOT NULL,
        status   INTEGER NOT NULL,
        revision INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (subject, target)
    );

    CREATE TABLE IF NOT EXISTS connection_log (
        subject      INTEGER NOT NULL,
        target       TEXT NOT NULL,
        count        INTEGER NOT NULL DEFAULT 0,
        last_seen_at INTEGER NOT NULL,
        hostname     TEXT,
        tag          TEXT,
        PRIMARY KEY (subject, target)
    );
    CREATE INDEX IF NOT EXISTS idx_conn_last_seen ON connection_log(last_seen_at);
";

impl Database {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        // WAL keeps rule-snapshot rebuilds from stalling behind flush writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests and as a fallback store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bulk-read every persisted rule. Called once at tunnel start.
    pub fn load_rules(&self) -> Result<Vec<PersistedRule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("SELECT subject, target, status, revision FROM ip_rules")?;

        let rows = stmt.query_map([], |row| {
            Ok(PersistedRule {
                subject: row.get(0)?,
                target: row.get(1)?,
                status: row.get(2)?,
                revision: row.get(3)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Insert or replace the rule at `(subject, target)`.
    pub fn upsert_rule(&self, subject: i64, target: &str, status: i64, revision: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO ip_rules (subject, target, status, revision)
             VALUES (?1, ?2, ?3, ?4)",
            params![subject, target, status, revision],
        )?;
        Ok(())
    }

    /// Write a batch of aggregator snapshots. Counts are authoritative in
    /// memory, so the row is overwritten rather than summed.
    pub fn upsert_connection_batch(&self, records: &[ConnectionRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO connection_log (subject, target, count, last_seen_at, hostname, tag)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(subject, target) DO UPDATE SET
                     count = excluded.count,
                     last_seen_at = excluded.last_seen_at,
                     hostname = excluded.hostname,
                     tag = excluded.tag",
            )?;
            for r in records {
                stmt.execute(params![
                    r.subject,
                    r.target,
                    r.count,
                    r.last_seen_ms,
                    r.hostname,
                    r.tag,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Read every persisted connection row, used to warm-start the aggregator.
    pub fn load_connections(&self) -> Result<Vec<ConnectionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT subject, target, count, last_seen_at, hostname, tag FROM connection_log",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ConnectionRecord {
                subject: row.get(0)?,
                target: row.get(1)?,
                count: row.get(2)?,
                last_seen_ms: row.get(3)?,
                hostname: row.get(4)?,
                tag: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Delete connection rows last seen before the cutoff (epoch ms).
    pub fn prune_connections(&self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM connection_log WHERE last_seen_at < ?1",
            params![cutoff_ms],
        )?;
        if deleted > 0 {
            tracing::info!("Pruned {deleted} connection records older than cutoff {cutoff_ms}");
        }
        Ok(deleted)
    }
}

/// Current Unix timestamp in milliseconds.
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
impl Database {
    /// Make rule loads fail, for exercising the StoreUnavailable path.
    pub(crate) fn break_rules_table(&self) {
        self.conn
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE ip_rules;")
            .expect("drop ip_rules");
    }
}
