//! Persistent memory: durable, versioned storage for critical entries.
//!
//! Every store appends a new version row; nothing is overwritten. Reads
//! return the latest version merged with the entry's access bookkeeping,
//! which lives in its own table so version rows stay immutable.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::memory::sqlite::{
    content_to_sql, format_datetime, metadata_to_sql, parse_datetime, SqliteHandle,
};
use crate::memory::types::{
    EntryId, MemoryEntry, ScoredEntry, Stage, CONTENT_MATCH_SCORE, METADATA_MATCH_SCORE,
};

/// One stored version of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryVersion {
    pub version: u32,
    pub entry: MemoryEntry,
    pub recorded_at: DateTime<Utc>,
}

/// Persistent memory statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentStats {
    /// Distinct entry ids
    pub entry_count: u64,
    /// Total version rows
    pub version_count: u64,
}

const LATEST_VERSIONS: &str = "
    SELECT v.id, v.version, v.content, v.metadata, v.importance, v.timestamp, v.recorded_at,
           a.last_accessed, COALESCE(a.access_count, 0)
    FROM entry_versions v
    LEFT JOIN entry_access a ON a.id = v.id
    WHERE v.version = (SELECT MAX(version) FROM entry_versions WHERE id = v.id)";

/// Durable versioned store.
pub struct PersistentMemory {
    db: SqliteHandle,
    clock: SharedClock,
}

impl PersistentMemory {
    /// Open or create a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        let db = SqliteHandle::open(Stage::Persistent, path)?;
        info!("opened persistent memory");
        Ok(Self { db, clock })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(clock: SharedClock) -> Result<Self> {
        Ok(Self {
            db: SqliteHandle::in_memory(Stage::Persistent)?,
            clock,
        })
    }

    /// Append a new version of `entry`. The write is durable once this
    /// returns `Ok(true)`.
    #[instrument(skip(self, entry), fields(id = %entry.id))]
    pub fn store(&self, entry: &MemoryEntry) -> Result<bool> {
        let recorded_at = self.clock.now();
        let version = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let latest = latest_version(&tx, &entry.id)?;
            let version = latest + 1;
            append_version(&tx, entry, version, &recorded_at)?;
            tx.commit()?;
            Ok(version)
        })?;
        debug!(version, "appended persistent version");
        Ok(true)
    }

    /// Append a new version only if the latest stored version equals
    /// `expected_latest` (0 for a new id). Returns the new version number.
    pub fn store_if_version(&self, entry: &MemoryEntry, expected_latest: u32) -> Result<u32> {
        let recorded_at = self.clock.now();
        let outcome = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let latest = latest_version(&tx, &entry.id)?;
            if latest != expected_latest {
                return Ok(Err(latest));
            }
            append_version(&tx, entry, latest + 1, &recorded_at)?;
            tx.commit()?;
            Ok(Ok(latest + 1))
        })?;

        outcome.map_err(|actual| {
            warn!(id = %entry.id, expected = expected_latest, actual, "version conflict");
            Error::version_conflict(entry.id.to_string(), expected_latest, actual)
        })
    }

    /// Latest version of an entry, recording the access.
    pub fn get_by_id(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        let now = format_datetime(&self.clock.now());
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if latest_version(&tx, id)? == 0 {
                return Ok(None);
            }
            touch(&tx, id, &now)?;
            let entry = tx
                .query_row(
                    &format!("{} AND v.id = ?1", LATEST_VERSIONS),
                    params![id.as_str()],
                    row_to_version,
                )
                .optional()?
                .map(|v| v.entry);
            tx.commit()?;
            Ok(entry)
        })
    }

    /// All versions of an entry, oldest first.
    pub fn get_versions(&self, id: &EntryId) -> Result<Vec<EntryVersion>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT v.id, v.version, v.content, v.metadata, v.importance, v.timestamp,
                        v.recorded_at, a.last_accessed, COALESCE(a.access_count, 0)
                 FROM entry_versions v
                 LEFT JOIN entry_access a ON a.id = v.id
                 WHERE v.id = ?1
                 ORDER BY v.version ASC",
            )?;
            let versions = stmt
                .query_map(params![id.as_str()], row_to_version)?
                .filter_map(|r| r.ok())
                .collect();
            Ok(versions)
        })
    }

    /// A specific version (1-based).
    pub fn get_version(&self, id: &EntryId, version: u32) -> Result<Option<EntryVersion>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT v.id, v.version, v.content, v.metadata, v.importance, v.timestamp,
                        v.recorded_at, a.last_accessed, COALESCE(a.access_count, 0)
                 FROM entry_versions v
                 LEFT JOIN entry_access a ON a.id = v.id
                 WHERE v.id = ?1 AND v.version = ?2",
                params![id.as_str(), version],
                row_to_version,
            )
            .optional()
        })
    }

    /// Number of stored versions of an entry; 0 if unknown.
    pub fn latest_version(&self, id: &EntryId) -> Result<u32> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM entry_versions WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
        })
    }

    /// Substring search over the latest versions. Content matches score
    /// above metadata matches; newer entries first within a score.
    pub fn search(&self, query: &str, n_results: usize) -> Result<Vec<ScoredEntry>> {
        if n_results == 0 {
            return Ok(Vec::new());
        }
        let needle = query.to_lowercase();
        let mut latest = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(LATEST_VERSIONS)?;
            let rows = stmt
                .query_map([], row_to_version)?
                .filter_map(|r| r.ok())
                .map(|v| v.entry)
                .collect::<Vec<_>>();
            Ok(rows)
        })?;
        latest.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut content_hits = Vec::new();
        let mut metadata_hits = Vec::new();
        for entry in latest {
            if entry.content_matches(&needle) {
                content_hits.push(ScoredEntry::new(entry, CONTENT_MATCH_SCORE));
            } else if entry.metadata_matches(&needle) {
                metadata_hits.push(ScoredEntry::new(entry, METADATA_MATCH_SCORE));
            }
        }
        content_hits.extend(metadata_hits);
        content_hits.truncate(n_results);

        let now = self.clock.now();
        let now_text = format_datetime(&now);
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for hit in &content_hits {
                touch(&tx, &hit.entry.id, &now_text)?;
            }
            tx.commit()
        })?;
        for hit in &mut content_hits {
            hit.entry.record_access(now);
        }
        Ok(content_hits)
    }

    /// Remove every version of an entry.
    pub fn remove(&self, id: &EntryId) -> Result<bool> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let rows = tx.execute(
                "DELETE FROM entry_versions WHERE id = ?1",
                params![id.as_str()],
            )?;
            tx.execute("DELETE FROM entry_access WHERE id = ?1", params![id.as_str()])?;
            tx.commit()?;
            Ok(rows > 0)
        })
    }

    pub fn get_stats(&self) -> Result<PersistentStats> {
        self.db.with_conn(|conn| {
            let (entries, versions): (i64, i64) = conn.query_row(
                "SELECT COUNT(DISTINCT id), COUNT(*) FROM entry_versions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(PersistentStats {
                entry_count: entries as u64,
                version_count: versions as u64,
            })
        })
    }

    pub fn close(&self) -> bool {
        self.db.close()
    }

    pub fn is_open(&self) -> bool {
        self.db.is_open()
    }
}

fn latest_version(tx: &Transaction, id: &EntryId) -> rusqlite::Result<u32> {
    tx.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM entry_versions WHERE id = ?1",
        params![id.as_str()],
        |row| row.get(0),
    )
}

fn append_version(
    tx: &Transaction,
    entry: &MemoryEntry,
    version: u32,
    recorded_at: &DateTime<Utc>,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO entry_versions (
            id, version, content, metadata, importance, timestamp, recorded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id.as_str(),
            version,
            content_to_sql(&entry.content),
            metadata_to_sql(&entry.metadata),
            entry.importance,
            format_datetime(&entry.timestamp),
            format_datetime(recorded_at),
        ],
    )?;
    // Carry bookkeeping from the source tier on first write
    tx.execute(
        "INSERT OR IGNORE INTO entry_access (id, last_accessed, access_count)
         VALUES (?1, ?2, ?3)",
        params![
            entry.id.as_str(),
            format_datetime(&entry.last_accessed),
            entry.access_count as i64,
        ],
    )?;
    Ok(())
}

fn touch(tx: &Transaction, id: &EntryId, now: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO entry_access (id, last_accessed, access_count) VALUES (?1, ?2, 1)
         ON CONFLICT(id) DO UPDATE SET
            last_accessed = excluded.last_accessed,
            access_count = access_count + 1",
        params![id.as_str(), now],
    )?;
    Ok(())
}

fn row_to_version(row: &rusqlite::Row) -> rusqlite::Result<EntryVersion> {
    let content_str: String = row.get(2)?;
    let metadata_str: String = row.get(3)?;
    let timestamp = parse_datetime(row.get::<_, String>(5)?);
    let last_accessed = row
        .get::<_, Option<String>>(7)?
        .map(parse_datetime)
        .unwrap_or(timestamp);

    Ok(EntryVersion {
        version: row.get(1)?,
        recorded_at: parse_datetime(row.get::<_, String>(6)?),
        entry: MemoryEntry {
            id: EntryId::from(row.get::<_, String>(0)?),
            content: serde_json::from_str(&content_str)
                .unwrap_or(serde_json::Value::String(content_str)),
            metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
            importance: row.get(4)?,
            timestamp,
            last_accessed,
            access_count: row.get::<_, i64>(8)? as u64,
            stage: Some(Stage::Persistent),
        },
    })
}
