//! Upload registry: one durable entry per uploaded artifact.
//!
//! Lifecycle is a small state machine, `NEW -> USED` or `NEW -> FAILED`.
//! An import first claims a NEW entry with a single check-and-set, so at most
//! one importer across every process sharing the registry reads its rows.
//! The final transition is a second check-and-set on the status.

use crate::{IngestError, IngestResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadStatus {
    New,
    Used,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::New => "NEW",
            UploadStatus::Used => "USED",
            UploadStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    // persisted tokens are case-sensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(UploadStatus::New),
            "USED" => Ok(UploadStatus::Used),
            "FAILED" => Ok(UploadStatus::Failed),
            other => Err(format!("unknown upload status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadEntry {
    pub token: String,
    pub storage_key: String,
    pub file_name: Option<String>,
    pub file_size: u64,
    pub content_type: Option<String>,
    /// CRC32 of the uploaded bytes
    pub checksum: u32,
    pub status: UploadStatus,
    pub row_count: Option<u64>,
    pub cycle_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Set once, when an import claims the entry.
    pub claimed_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub ledger_id: Option<i64>,
}

impl UploadEntry {
    pub fn new(token: impl Into<String>, storage_key: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            storage_key: storage_key.into(),
            file_name: None,
            file_size: 0,
            content_type: None,
            checksum: 0,
            status: UploadStatus::New,
            row_count: None,
            cycle_count: None,
            created_at: Utc::now(),
            claimed_at: None,
            used_at: None,
            ledger_id: None,
        }
    }
}

/// Completion details recorded with the NEW -> USED transition.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub ledger_id: i64,
    pub row_count: u64,
    pub used_at: DateTime<Utc>,
}

pub trait UploadRegistry: Send + Sync {
    fn insert(&self, entry: &UploadEntry) -> IngestResult<()>;

    fn find(&self, token: &str) -> IngestResult<Option<UploadEntry>>;

    /// Fill in draft statistics; status is untouched.
    fn record_stats(&self, token: &str, row_count: u64, cycle_count: i64) -> IngestResult<()>;

    /// Reserve a NEW, unclaimed entry for one import.
    ///
    /// Fails with [`IngestError::StatusConflict`] once the entry left NEW and
    /// with [`IngestError::ImportInProgress`] if another import holds it.
    fn claim(&self, token: &str) -> IngestResult<()>;

    /// NEW -> USED. Fails with [`IngestError::StatusConflict`] if the entry left NEW.
    fn mark_used(&self, token: &str, completion: Completion) -> IngestResult<()>;

    /// NEW -> FAILED. Same conflict rule as [`UploadRegistry::mark_used`].
    fn mark_failed(&self, token: &str) -> IngestResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: Mutex<HashMap<String, UploadEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        token: &str,
        to: UploadStatus,
        apply: impl FnOnce(&mut UploadEntry),
    ) -> IngestResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(token)
            .ok_or_else(|| IngestError::TokenNotFound(token.to_string()))?;
        if entry.status != UploadStatus::New {
            return Err(IngestError::StatusConflict {
                token: token.to_string(),
                status: entry.status,
            });
        }
        entry.status = to;
        apply(entry);
        info!(token, status = %to, "upload status changed");
        Ok(())
    }
}

impl UploadRegistry for MemoryRegistry {
    fn insert(&self, entry: &UploadEntry) -> IngestResult<()> {
        self.entries
            .lock()
            .insert(entry.token.clone(), entry.clone());
        Ok(())
    }

    fn find(&self, token: &str) -> IngestResult<Option<UploadEntry>> {
        Ok(self.entries.lock().get(token).cloned())
    }

    fn record_stats(&self, token: &str, row_count: u64, cycle_count: i64) -> IngestResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(token)
            .ok_or_else(|| IngestError::TokenNotFound(token.to_string()))?;
        entry.row_count = Some(row_count);
        entry.cycle_count = Some(cycle_count);
        Ok(())
    }

    fn claim(&self, token: &str) -> IngestResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(token)
            .ok_or_else(|| IngestError::TokenNotFound(token.to_string()))?;
        if entry.status != UploadStatus::New {
            return Err(IngestError::StatusConflict {
                token: token.to_string(),
                status: entry.status,
            });
        }
        if entry.claimed_at.is_some() {
            return Err(IngestError::ImportInProgress(token.to_string()));
        }
        entry.claimed_at = Some(Utc::now());
        info!(token, "upload claimed for import");
        Ok(())
    }

    fn mark_used(&self, token: &str, completion: Completion) -> IngestResult<()> {
        self.transition(token, UploadStatus::Used, |e| {
            e.ledger_id = Some(completion.ledger_id);
            e.row_count = Some(completion.row_count);
            e.used_at = Some(completion.used_at);
        })
    }

    fn mark_failed(&self, token: &str) -> IngestResult<()> {
        self.transition(token, UploadStatus::Failed, |_| {})
    }
}

const REGISTRY_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS battery_csv_upload (
    upload_token TEXT PRIMARY KEY,
    file_key TEXT NOT NULL,
    file_name TEXT,
    file_size INTEGER NOT NULL DEFAULT 0,
    content_type TEXT,
    checksum INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    row_count INTEGER,
    cycle_count INTEGER,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    used_at TEXT,
    battery_id INTEGER
) WITHOUT ROWID;
"#;

/// Registry rows in SQLite. Transitions are one conditional UPDATE.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
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
        conn.execute_batch(REGISTRY_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn transition(
        &self,
        token: &str,
        to: UploadStatus,
        completion: Option<Completion>,
    ) -> IngestResult<()> {
        let conn = self.conn.lock();
        let changed = match completion {
            Some(c) => conn.execute(
                "UPDATE battery_csv_upload
                 SET status = ?2, battery_id = ?3, row_count = ?4, used_at = ?5
                 WHERE upload_token = ?1 AND status = 'NEW'",
                params![
                    token,
                    to.as_str(),
                    c.ledger_id,
                    c.row_count as i64,
                    c.used_at.to_rfc3339()
                ],
            )?,
            None => conn.execute(
                "UPDATE battery_csv_upload SET status = ?2
                 WHERE upload_token = ?1 AND status = 'NEW'",
                params![token, to.as_str()],
            )?,
        };
        if changed == 1 {
            info!(token, status = %to, "upload status changed");
            return Ok(());
        }

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM battery_csv_upload WHERE upload_token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            None => Err(IngestError::TokenNotFound(token.to_string())),
            Some(s) => Err(IngestError::StatusConflict {
                token: token.to_string(),
                status: parse_status(&s)?,
            }),
        }
    }
}

fn parse_status(s: &str) -> IngestResult<UploadStatus> {
    s.parse().map_err(|e: String| {
        IngestError::Sqlite(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        ))
    })
}

fn parse_time(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl UploadRegistry for SqliteRegistry {
    fn insert(&self, entry: &UploadEntry) -> IngestResult<()> {
        self.conn.lock().execute(
            "INSERT INTO battery_csv_upload
             (upload_token, file_key, file_name, file_size, content_type, checksum,
              status, row_count, cycle_count, created_at, claimed_at, used_at, battery_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.token,
                entry.storage_key,
                entry.file_name,
                entry.file_size as i64,
                entry.content_type,
                entry.checksum as i64,
                entry.status.as_str(),
                entry.row_count.map(|n| n as i64),
                entry.cycle_count,
                entry.created_at.to_rfc3339(),
                entry.claimed_at.map(|t| t.to_rfc3339()),
                entry.used_at.map(|t| t.to_rfc3339()),
                entry.ledger_id,
            ],
        )?;
        Ok(())
    }

    fn find(&self, token: &str) -> IngestResult<Option<UploadEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT upload_token, file_key, file_name, file_size, content_type, checksum,
                        status, row_count, cycle_count, created_at, claimed_at, used_at, battery_id
                 FROM battery_csv_upload WHERE upload_token = ?1",
                params![token],
                |row| {
                    let status: String = row.get(6)?;
                    let created_at: String = row.get(9)?;
                    let claimed_at: Option<String> = row.get(10)?;
                    let used_at: Option<String> = row.get(11)?;
                    Ok((
                        UploadEntry {
                            token: row.get(0)?,
                            storage_key: row.get(1)?,
                            file_name: row.get(2)?,
                            file_size: row.get::<_, i64>(3)? as u64,
                            content_type: row.get(4)?,
                            checksum: row.get::<_, i64>(5)? as u32,
                            status: UploadStatus::New,
                            row_count: row.get::<_, Option<i64>>(7)?.map(|n| n as u64),
                            cycle_count: row.get(8)?,
                            created_at: parse_time(&created_at)?,
                            claimed_at: claimed_at.as_deref().map(parse_time).transpose()?,
                            used_at: used_at.as_deref().map(parse_time).transpose()?,
                            ledger_id: row.get(12)?,
                        },
                        status,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((mut entry, status)) => {
                entry.status = parse_status(&status)?;
                Ok(Some(entry))
            }
        }
    }

    fn record_stats(&self, token: &str, row_count: u64, cycle_count: i64) -> IngestResult<()> {
        let changed = self.conn.lock().execute(
            "UPDATE battery_csv_upload SET row_count = ?2, cycle_count = ?3 WHERE upload_token = ?1",
            params![token, row_count as i64, cycle_count],
        )?;
        if changed == 0 {
            return Err(IngestError::TokenNotFound(token.to_string()));
        }
        Ok(())
    }

    fn claim(&self, token: &str) -> IngestResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE battery_csv_upload SET claimed_at = ?2
             WHERE upload_token = ?1 AND status = 'NEW' AND claimed_at IS NULL",
            params![token, Utc::now().to_rfc3339()],
        )?;
        if changed == 1 {
            info!(token, "upload claimed for import");
            return Ok(());
        }

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM battery_csv_upload WHERE upload_token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        match current.as_deref().map(parse_status).transpose()? {
            None => Err(IngestError::TokenNotFound(token.to_string())),
            Some(UploadStatus::New) => Err(IngestError::ImportInProgress(token.to_string())),
            Some(status) => Err(IngestError::StatusConflict {
                token: token.to_string(),
                status,
            }),
        }
    }

    fn mark_used(&self, token: &str, completion: Completion) -> IngestResult<()> {
        self.transition(token, UploadStatus::Used, Some(completion))
    }

    fn mark_failed(&self, token: &str) -> IngestResult<()> {
        self.transition(token, UploadStatus::Failed, None)
    }
}
