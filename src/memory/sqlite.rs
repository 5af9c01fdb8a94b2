//! SQLite connection handle and row mapping shared by the durable tiers.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::memory::schema::{initialize_schema, is_initialized};
use crate::memory::types::{EntryId, MemoryEntry, Metadata, Stage};

/// Column list matching [`row_to_entry`].
pub(crate) const ENTRY_COLUMNS: &str =
    "id, content, metadata, importance, timestamp, last_accessed, access_count";

/// A tier's SQLite connection. `close` drops the connection; every later
/// call fails with `BackingStoreUnavailable`.
pub(crate) struct SqliteHandle {
    stage: Stage,
    conn: Mutex<Option<Connection>>,
}

impl SqliteHandle {
    /// Open or create the tier database at `path`.
    pub fn open(stage: Stage, path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::backing_store(stage, e.to_string()))?;

        if !is_initialized(&conn, stage) {
            initialize_schema(&conn, stage)
                .map_err(|e| Error::backing_store(stage, e.to_string()))?;
        }

        Ok(Self {
            stage,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Create an in-memory database (for testing and ephemeral tiers).
    pub fn in_memory(stage: Stage) -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| Error::backing_store(stage, e.to_string()))?;
        initialize_schema(&conn, stage).map_err(|e| Error::backing_store(stage, e.to_string()))?;

        Ok(Self {
            stage,
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.with_conn_mut(|conn| f(conn))
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::backing_store(self.stage, "store is closed"))?;
        f(conn).map_err(|e| Error::backing_store(self.stage, e.to_string()))
    }

    /// Release the connection. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        match self.conn.lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(poisoned) => poisoned.into_inner().take().is_some(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn content_to_sql(content: &Value) -> String {
    serde_json::to_string(content).unwrap_or_default()
}

pub(crate) fn metadata_to_sql(metadata: &Metadata) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

/// Map a row selected with [`ENTRY_COLUMNS`] to an entry.
pub(crate) fn row_to_entry(row: &Row) -> rusqlite::Result<MemoryEntry> {
    let content_str: String = row.get(1)?;
    let metadata_str: String = row.get(2)?;

    Ok(MemoryEntry {
        id: EntryId::from(row.get::<_, String>(0)?),
        content: serde_json::from_str(&content_str).unwrap_or(Value::String(content_str)),
        metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
        importance: row.get(3)?,
        timestamp: parse_datetime(row.get::<_, String>(4)?),
        last_accessed: parse_datetime(row.get::<_, String>(5)?),
        access_count: row.get::<_, i64>(6)? as u64,
        stage: None,
    })
}

/// Pack an embedding as little-endian f32 bytes.
pub(crate) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn blob_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_handle_reports_unavailable() {
        let handle = SqliteHandle::in_memory(Stage::Episodic).unwrap();
        assert!(handle.is_open());
        assert!(handle.close());
        assert!(!handle.close());

        let err = handle
            .with_conn(|conn| conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)))
            .unwrap_err();
        assert!(err.is_backing_store());
    }

    #[test]
    fn test_datetime_text_sorts_chronologically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1500);
        assert!(format_datetime(&earlier) < format_datetime(&later));
        assert_eq!(parse_datetime(format_datetime(&earlier)), earlier);
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let embedding = vec![0.25f32, -1.5, 3.0];
        assert_eq!(blob_to_embedding(&embedding_to_blob(&embedding)), embedding);
    }
}
