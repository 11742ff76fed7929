use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use serde::Serialize;
use tracing::{debug, info};

use crate::db;
use crate::errors::{AppError, AppResult};
use crate::normalize::strict_normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Open,
    Closed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Open => "open",
            QueueStatus::Closed => "closed",
        }
    }
}

impl ToSql for QueueStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for QueueStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "open" => Ok(QueueStatus::Open),
            "closed" => Ok(QueueStatus::Closed),
            other => Err(FromSqlError::Other(
                format!("unknown queue status: {other}").into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualQueueEntry {
    pub id: i64,
    pub address_norm: String,
    pub raw_address: String,
    pub reason: String,
    pub note: Option<String>,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManualQueueStats {
    pub total: usize,
    pub open: usize,
    pub closed: usize,
    pub by_reason: BTreeMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct ExportRecord<'a> {
    id: i64,
    address_norm: &'a str,
    raw_address: &'a str,
    reason: &'a str,
    note: Option<&'a str>,
    status: &'static str,
    created_at: String,
}

const SELECT_COLUMNS: &str =
    "id, address_norm, raw_address, reason, note, status, created_at, closed_at";

/// Addresses that need a human to supply coordinates.
#[derive(Clone)]
pub struct ManualQueueStore {
    db: Arc<Mutex<Connection>>,
}

impl ManualQueueStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// With `dedup`, earlier rows for the same key are dropped first so the open
    /// queue carries only the latest reason per address.
    pub fn add_open(
        &self,
        raw_address: &str,
        reason: &str,
        note: Option<&str>,
        dedup: bool,
    ) -> AppResult<ManualQueueEntry> {
        let key = strict_normalize(raw_address);
        if key.is_empty() {
            return Err(AppError::EmptyKey);
        }
        let now = db::now_timestamp();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        if dedup {
            let dropped = tx.execute(
                "DELETE FROM manual_queue WHERE address_norm = ?1",
                [key.as_str()],
            )?;
            if dropped > 0 {
                debug!(target: "manual_queue", key = %key, dropped, "replaced queued rows");
            }
        }
        tx.execute(
            "INSERT INTO manual_queue (address_norm, raw_address, reason, note, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (key.as_str(), raw_address, reason, note, QueueStatus::Open, now),
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!(target: "manual_queue", id, key = %key, reason, "address queued for manual geocoding");
        Ok(ManualQueueEntry {
            id,
            address_norm: key,
            raw_address: raw_address.to_string(),
            reason: reason.to_string(),
            note: note.map(str::to_string),
            status: QueueStatus::Open,
            created_at: now,
            closed_at: None,
        })
    }

    /// Open rows, newest first.
    pub fn list_open(&self, limit: usize) -> AppResult<Vec<ManualQueueEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM manual_queue
            WHERE status = 'open'
            ORDER BY created_at DESC, id DESC
            LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map([limit as i64], parse_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Closes every open row for the key. Returns whether anything was open.
    pub fn close(&self, key: &str) -> AppResult<bool> {
        let key = strict_normalize(key);
        let conn = self.db.lock();
        let closed = conn.execute(
            "UPDATE manual_queue SET status = 'closed', closed_at = ?2
            WHERE address_norm = ?1 AND status = 'open'",
            (key.as_str(), db::now_timestamp()),
        )?;
        if closed > 0 {
            debug!(target: "manual_queue", key = %key, closed, "queue rows closed");
        }
        Ok(closed > 0)
    }

    pub fn is_open(&self, key: &str) -> AppResult<bool> {
        let key = strict_normalize(key);
        let conn = self.db.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM manual_queue WHERE address_norm = ?1 AND status = 'open')",
            [key.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn stats(&self) -> AppResult<ManualQueueStats> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare("SELECT status, reason, COUNT(*) FROM manual_queue GROUP BY status, reason")?;
        let mut rows = stmt.query([])?;
        let mut stats = ManualQueueStats {
            total: 0,
            open: 0,
            closed: 0,
            by_reason: BTreeMap::new(),
        };
        while let Some(row) = rows.next()? {
            let status: QueueStatus = row.get(0)?;
            let reason: String = row.get(1)?;
            let count = row.get::<_, i64>(2)? as usize;
            stats.total += count;
            match status {
                QueueStatus::Open => stats.open += count,
                QueueStatus::Closed => stats.closed += count,
            }
            *stats.by_reason.entry(reason).or_insert(0) += count;
        }
        Ok(stats)
    }

    /// Writes open rows to CSV and returns how many were written.
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> AppResult<usize> {
        let path = path.as_ref();
        let rows = self.list_open(i64::MAX as usize)?;
        let mut writer = csv::Writer::from_path(path)?;
        for entry in &rows {
            writer.serialize(ExportRecord {
                id: entry.id,
                address_norm: &entry.address_norm,
                raw_address: &entry.raw_address,
                reason: &entry.reason,
                note: entry.note.as_deref(),
                status: entry.status.as_str(),
                created_at: entry.created_at.to_rfc3339(),
            })?;
        }
        writer.flush()?;
        info!(
            target: "manual_queue",
            path = %path.display(),
            rows = rows.len(),
            "manual queue exported"
        );
        Ok(rows.len())
    }

    pub fn clear_all(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        Ok(conn.execute("DELETE FROM manual_queue", [])?)
    }
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManualQueueEntry> {
    Ok(ManualQueueEntry {
        id: row.get(0)?,
        address_norm: row.get(1)?,
        raw_address: row.get(2)?,
        reason: row.get(3)?,
        note: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
        closed_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn store() -> ManualQueueStore {
        ManualQueueStore::new(Arc::new(Mutex::new(open_in_memory().unwrap())))
    }

    #[test]
    fn dedup_keeps_latest_reason_only() {
        let store = store();
        store
            .add_open("Unbekannt 1, Dresden", "invalid_coordinates", None, true)
            .unwrap();
        store
            .add_open(" Unbekannt 1,  Dresden", "geocode_miss", Some("zweiter Versuch"), true)
            .unwrap();

        let open = store.list_open(10).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].reason, "geocode_miss");
        assert_eq!(open[0].note.as_deref(), Some("zweiter Versuch"));
        assert_eq!(open[0].address_norm, "Unbekannt 1, Dresden");
        assert_eq!(open[0].raw_address, " Unbekannt 1,  Dresden");
    }

    #[test]
    fn without_dedup_rows_accumulate() {
        let store = store();
        store.add_open("Unbekannt 1", "geocode_miss", None, false).unwrap();
        let second = store.add_open("Unbekannt 1", "geocode_miss", None, false).unwrap();
        let open = store.list_open(10).unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].id, second.id);
    }

    #[test]
    fn close_and_stats() {
        let store = store();
        store.add_open("A 1", "geocode_miss", None, true).unwrap();
        store.add_open("B 2", "invalid_coordinates", None, true).unwrap();
        assert!(store.is_open("A 1").unwrap());

        assert!(store.close("A 1").unwrap());
        assert!(!store.close("A 1").unwrap());
        assert!(!store.is_open("A 1").unwrap());
        assert!(!store.close("Nie gesehen").unwrap());

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.by_reason.get("geocode_miss"), Some(&1));
        assert_eq!(stats.by_reason.get("invalid_coordinates"), Some(&1));

        let open = store.list_open(10).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].address_norm, "B 2");
    }

    #[test]
    fn rejects_blank_addresses() {
        let store = store();
        assert!(matches!(
            store.add_open("  ", "geocode_miss", None, true),
            Err(AppError::EmptyKey)
        ));
    }

    #[test]
    fn exports_open_rows_to_csv() {
        let store = store();
        store.add_open("A 1", "geocode_miss", Some("Hof"), true).unwrap();
        store.add_open("B 2", "geocode_miss", None, true).unwrap();
        store.close("B 2").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.csv");
        assert_eq!(store.export_csv(&path).unwrap(), 1);

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next(),
            Some("id,address_norm,raw_address,reason,note,status,created_at")
        );
        let row = lines.next().unwrap();
        assert!(row.contains("A 1,A 1,geocode_miss,Hof,open,"));
        assert!(lines.next().is_none());
        assert_eq!(store.clear_all().unwrap(), 2);
    }
}
