//! SQLite adapters
//!
//! File-based persistent storage for records and the bulk index queue.
//! One connection per adapter, serialized behind a mutex.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::domain::{BulkQueue, IndexOp, QueueEntry, Record, RecordStore, DEFAULT_LEASE_SECS};
use crate::error::{ErrorKind, Result, StorageError};

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| StorageError::serialization(format!("Invalid uuid {}: {}", raw, e)))
}

struct RecordRow {
    pid: String,
    id: String,
    record_type: String,
    revision_id: i64,
    metadata: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl RecordRow {
    const COLUMNS: &'static str =
        "pid, id, record_type, revision_id, metadata, created, updated";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pid: row.get(0)?,
            id: row.get(1)?,
            record_type: row.get(2)?,
            revision_id: row.get(3)?,
            metadata: row.get(4)?,
            created: row.get(5)?,
            updated: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<Record> {
        Ok(Record {
            pid: self.pid,
            id: parse_uuid(&self.id)?,
            record_type: self.record_type,
            revision_id: self.revision_id as u64,
            metadata: serde_json::from_str(&self.metadata)?,
            created: self.created,
            updated: self.updated,
        })
    }
}

/// SQLite-based RecordStore implementation
#[derive(Clone)]
pub struct SqliteRecordStore {
    record_type: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Create a new SQLite store at the given path
    pub fn new(db_path: impl AsRef<Path>, record_type: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn, record_type)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn in_memory(record_type: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, record_type)
    }

    fn with_connection(conn: Connection, record_type: impl Into<String>) -> Result<Self> {
        let store = Self {
            record_type: record_type.into(),
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                pid TEXT NOT NULL,
                record_type TEXT NOT NULL,
                revision_id INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                created TEXT NOT NULL,
                updated TEXT NOT NULL,
                UNIQUE (record_type, pid)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_type_created
             ON records(record_type, created)",
            [],
        )?;

        Ok(())
    }

    fn stored_revision(conn: &Connection, id: &Uuid) -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT revision_id FROM records WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn record_type(&self) -> &str {
        &self.record_type
    }

    async fn insert(&self, mut record: Record) -> Result<Record> {
        if record.record_type != self.record_type {
            return Err(StorageError::new(
                ErrorKind::Config,
                format!(
                    "Record type {} does not belong in store {}",
                    record.record_type, self.record_type
                ),
            ));
        }

        let conn = self.conn.lock();
        let taken: Option<String> = conn
            .query_row(
                "SELECT pid FROM records WHERE id = ?1 OR (record_type = ?2 AND pid = ?3)",
                params![record.id.to_string(), &record.record_type, &record.pid],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(StorageError::already_exists(record.pid));
        }

        record.revision_id = 1;
        conn.execute(
            "INSERT INTO records (id, pid, record_type, revision_id, metadata, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                &record.pid,
                &record.record_type,
                record.revision_id as i64,
                serde_json::to_string(&record.metadata)?,
                record.created,
                record.updated
            ],
        )?;
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM records WHERE id = ?1 AND record_type = ?2",
                    RecordRow::COLUMNS
                ),
                params![id.to_string(), &self.record_type],
                RecordRow::from_row,
            )
            .optional()?;
        row.map(RecordRow::into_record).transpose()
    }

    async fn resolve(&self, pid: &str) -> Result<Record> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM records WHERE record_type = ?1 AND pid = ?2",
                    RecordRow::COLUMNS
                ),
                params![&self.record_type, pid],
                RecordRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => row.into_record(),
            None => Err(StorageError::not_found(pid)),
        }
    }

    async fn commit(&self, mut record: Record) -> Result<Record> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let updated = Utc::now();
        let changed = tx.execute(
            "UPDATE records SET metadata = ?1, revision_id = revision_id + 1, updated = ?2
             WHERE id = ?3 AND revision_id = ?4",
            params![
                serde_json::to_string(&record.metadata)?,
                updated,
                record.id.to_string(),
                record.revision_id as i64
            ],
        )?;

        if changed == 0 {
            return match Self::stored_revision(&tx, &record.id)? {
                Some(found) => Err(StorageError::revision_conflict(
                    &record.pid,
                    record.revision_id,
                    found as u64,
                )),
                None => Err(StorageError::not_found(record.pid)),
            };
        }

        tx.commit()
            .map_err(|e| StorageError::transaction(format!("Commit failed: {}", e)))?;

        record.revision_id += 1;
        record.updated = updated;
        Ok(record)
    }

    async fn delete(&self, record: &Record) -> Result<Record> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let row = tx
            .query_row(
                &format!("SELECT {} FROM records WHERE id = ?1", RecordRow::COLUMNS),
                params![record.id.to_string()],
                RecordRow::from_row,
            )
            .optional()?
            .ok_or_else(|| StorageError::not_found(record.pid.clone()))?;

        tx.execute(
            "DELETE FROM records WHERE id = ?1",
            params![record.id.to_string()],
        )?;
        tx.commit()
            .map_err(|e| StorageError::transaction(format!("Commit failed: {}", e)))?;

        let mut removed = row.into_record()?;
        removed.revision_id += 1;
        removed.updated = Utc::now();
        Ok(removed)
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM records WHERE record_type = ?1 ORDER BY created, id",
        )?;
        let raw: Vec<String> = stmt
            .query_map(params![&self.record_type], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        raw.iter().map(|id| parse_uuid(id)).collect()
    }

    async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE record_type = ?1",
            params![&self.record_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// SQLite-based durable BulkQueue
///
/// Claimed rows get a `leased_at` stamp (epoch microseconds) and are deleted
/// on `ack`. Dedup only applies to rows that are not leased.
#[derive(Clone)]
pub struct SqliteBulkQueue {
    conn: Arc<Mutex<Connection>>,
    lease: Duration,
}

impl SqliteBulkQueue {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    /// Set how long a claimed entry stays leased
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bulk_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL,
                op TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                leased_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_bulk_queue_pending
                ON bulk_queue(record_id, op) WHERE leased_at IS NULL;",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
        })
    }

    fn insert_entries(tx: &Connection, entries: &[QueueEntry]) -> Result<usize> {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO bulk_queue (record_id, op, enqueued_at, attempts)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let mut added = 0;
        for entry in entries {
            added += stmt.execute(params![
                entry.record_id.to_string(),
                entry.op.as_str(),
                entry.enqueued_at,
                entry.attempts
            ])?;
        }
        Ok(added)
    }

    fn delete_leased(tx: &Connection, entries: &[QueueEntry]) -> Result<usize> {
        let mut stmt =
            tx.prepare("DELETE FROM bulk_queue WHERE seq = ?1 AND leased_at IS NOT NULL")?;
        let mut removed = 0;
        for ticket in entries.iter().filter_map(|entry| entry.ticket) {
            removed += stmt.execute(params![ticket])?;
        }
        Ok(removed)
    }

    fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<QueueEntry> {
        let record_id: String = row.get(1)?;
        let op: String = row.get(2)?;
        Ok(QueueEntry {
            record_id: parse_uuid(&record_id)?,
            op: IndexOp::from_str(&op)?,
            enqueued_at: row.get(3)?,
            attempts: row.get(4)?,
            ticket: Some(row.get(0)?),
        })
    }
}

#[async_trait]
impl BulkQueue for SqliteBulkQueue {
    async fn enqueue(&self, entries: &[QueueEntry]) -> Result<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let added = Self::insert_entries(&tx, entries)?;
        tx.commit()
            .map_err(|e| StorageError::transaction(format!("Enqueue failed: {}", e)))?;
        Ok(added)
    }

    async fn claim(&self, max: usize) -> Result<Vec<QueueEntry>> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().timestamp_micros();
        let cutoff = (Utc::now() - self.lease).timestamp_micros();

        let rows: Vec<(i64, Result<QueueEntry>)> = {
            let mut stmt = tx.prepare(
                "SELECT seq, record_id, op, enqueued_at, attempts
                 FROM bulk_queue
                 WHERE leased_at IS NULL OR leased_at <= ?2
                 ORDER BY seq LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![max as i64, cutoff], |row| {
                    Ok((row.get(0)?, Self::entry_from_row(row)))
                })?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };

        let mut claimed = Vec::with_capacity(rows.len());
        {
            let mut lease = tx.prepare("UPDATE bulk_queue SET leased_at = ?1 WHERE seq = ?2")?;
            let mut drop_row = tx.prepare("DELETE FROM bulk_queue WHERE seq = ?1")?;
            for (seq, entry) in rows {
                match entry {
                    Ok(entry) => {
                        lease.execute(params![now, seq])?;
                        claimed.push(entry);
                    }
                    Err(e) => {
                        error!(seq, error = %e, "Dead-lettering unreadable bulk queue row");
                        drop_row.execute(params![seq])?;
                    }
                }
            }
        }

        tx.commit()
            .map_err(|e| StorageError::transaction(format!("Claim failed: {}", e)))?;
        Ok(claimed)
    }

    async fn ack(&self, entries: &[QueueEntry]) -> Result<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let removed = Self::delete_leased(&tx, entries)?;
        tx.commit()
            .map_err(|e| StorageError::transaction(format!("Ack failed: {}", e)))?;
        Ok(removed)
    }

    async fn retry(&self, entries: &[QueueEntry]) -> Result<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let added = Self::insert_entries(&tx, entries)?;
        Self::delete_leased(&tx, entries)?;
        tx.commit()
            .map_err(|e| StorageError::transaction(format!("Retry failed: {}", e)))?;
        Ok(added)
    }

    async fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM bulk_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
