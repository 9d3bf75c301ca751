//! Persistent battery records and the bulk-write seam to the ledger store.

use crate::IngestResult;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;

/// One accepted CSV row plus provenance. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryRecord {
    pub ledger_id: i64,
    pub cycle: i64,
    pub time_min: f64,
    pub voltage: f64,
    pub current: f64,
    pub temp: Option<f64>,
    pub capacity: Option<f64>,
    pub source_file: Option<String>,
    /// upload token the record came from
    pub upload_batch: String,
}

/// Bulk writes, one call per flushed batch, in scan order.
pub trait RecordStore: Send + Sync {
    fn insert_batch(&self, records: &[BatteryRecord]) -> IngestResult<()>;
}

/// Keeps records in memory and remembers each batch size.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryRecords>,
}

#[derive(Debug, Default)]
struct MemoryRecords {
    records: Vec<BatteryRecord>,
    batches: Vec<usize>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<BatteryRecord> {
        self.inner.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of every `insert_batch` call so far.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.lock().batches.clone()
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert_batch(&self, records: &[BatteryRecord]) -> IngestResult<()> {
        let mut inner = self.inner.lock();
        inner.records.extend_from_slice(records);
        inner.batches.push(records.len());
        Ok(())
    }
}

const RECORD_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS battery_record (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    battery_id INTEGER NOT NULL,
    cycle INTEGER NOT NULL,
    time_min REAL NOT NULL,
    voltage REAL NOT NULL,
    current REAL NOT NULL,
    temp REAL,
    capacity REAL,
    source_file TEXT,
    upload_batch TEXT
);

CREATE INDEX IF NOT EXISTS idx_battery_record_battery_cycle
    ON battery_record(battery_id, cycle);
"#;

/// Records in SQLite; each batch is one transaction.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> IngestResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> IngestResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> IngestResult<Self> {
        conn.execute_batch(RECORD_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn count_for_batch(&self, upload_batch: &str) -> IngestResult<u64> {
        let n: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM battery_record WHERE upload_batch = ?1",
            params![upload_batch],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

impl RecordStore for SqliteRecordStore {
    fn insert_batch(&self, records: &[BatteryRecord]) -> IngestResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO battery_record
                 (battery_id, cycle, time_min, voltage, current, temp, capacity, source_file, upload_batch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.ledger_id,
                    r.cycle,
                    r.time_min,
                    r.voltage,
                    r.current,
                    r.temp,
                    r.capacity,
                    r.source_file,
                    r.upload_batch,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cycle: i64) -> BatteryRecord {
        BatteryRecord {
            ledger_id: 1,
            cycle,
            time_min: 0.5,
            voltage: 3.7,
            current: 1.0,
            temp: None,
            capacity: Some(2.0),
            source_file: Some("b1c0.csv".into()),
            upload_batch: "tok".into(),
        }
    }

    #[test]
    fn sqlite_batches_are_counted_per_upload() {
        let store = SqliteRecordStore::in_memory().unwrap();
        store.insert_batch(&[record(1), record(2)]).unwrap();
        store.insert_batch(&[record(3)]).unwrap();
        assert_eq!(store.count_for_batch("tok").unwrap(), 3);
        assert_eq!(store.count_for_batch("other").unwrap(), 0);
    }
}
