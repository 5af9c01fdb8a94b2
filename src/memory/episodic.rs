//! Episodic memory: events indexed by time and affect.
//!
//! Backed by SQLite. Emotional valence and arousal are lifted out of the
//! metadata map into indexed columns on write so range queries never scan
//! JSON.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::memory::sqlite::{
    content_to_sql, format_datetime, metadata_to_sql, parse_datetime, row_to_entry,
    SqliteHandle, ENTRY_COLUMNS,
};
use crate::memory::types::{
    EntryId, MemoryEntry, ScoredEntry, Stage, CONTENT_MATCH_SCORE, METADATA_MATCH_SCORE,
};

/// Episodic memory statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodicStats {
    pub entry_count: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    /// Entries carrying an emotional valence
    pub with_valence: u64,
    pub average_importance: f64,
}

/// SQLite-backed event store.
pub struct EpisodicMemory {
    db: SqliteHandle,
    clock: SharedClock,
}

impl EpisodicMemory {
    /// Open or create an episodic store at the given path.
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        Ok(Self {
            db: SqliteHandle::open(Stage::Episodic, path)?,
            clock,
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(clock: SharedClock) -> Result<Self> {
        Ok(Self {
            db: SqliteHandle::in_memory(Stage::Episodic)?,
            clock,
        })
    }

    /// Persist an entry, replacing any existing entry with the same id.
    pub fn store(&self, entry: &MemoryEntry) -> Result<bool> {
        let metadata_text = metadata_to_sql(&entry.metadata).to_lowercase();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO episodes (
                    id, content, content_text, metadata, metadata_text, importance,
                    timestamp, last_accessed, access_count, valence, arousal
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    entry.id.as_str(),
                    content_to_sql(&entry.content),
                    entry.content_text().to_lowercase(),
                    metadata_to_sql(&entry.metadata),
                    metadata_text,
                    entry.importance,
                    format_datetime(&entry.timestamp),
                    format_datetime(&entry.last_accessed),
                    entry.access_count as i64,
                    entry.emotional_valence(),
                    entry.emotional_arousal(),
                ],
            )?;
            Ok(())
        })?;
        debug!(id = %entry.id, "stored episode");
        Ok(true)
    }

    /// Get an entry by id, recording the access.
    pub fn get_by_id(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        let now = format_datetime(&self.clock.now());
        let entry = self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE episodes SET access_count = access_count + 1, last_accessed = ?2
                 WHERE id = ?1",
                params![id.as_str(), now],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            conn.query_row(
                &format!("SELECT {} FROM episodes WHERE id = ?1", ENTRY_COLUMNS),
                params![id.as_str()],
                row_to_entry,
            )
            .optional()
        })?;
        Ok(entry.map(|e| e.with_stage(Stage::Episodic)))
    }

    /// All entries with `start <= timestamp <= end`, oldest first.
    pub fn get_temporal_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MemoryEntry>> {
        self.select(
            "WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp ASC",
            params![format_datetime(&start), format_datetime(&end)],
        )
    }

    /// Entries whose emotional valence lies in `[valence_min, valence_max]`.
    /// Entries without a valence are excluded.
    pub fn get_by_emotion(&self, valence_min: f64, valence_max: f64) -> Result<Vec<MemoryEntry>> {
        self.select(
            "WHERE valence IS NOT NULL AND valence >= ?1 AND valence <= ?2
             ORDER BY timestamp ASC",
            params![valence_min, valence_max],
        )
    }

    /// Entries whose emotional arousal lies in `[arousal_min, arousal_max]`.
    pub fn get_by_arousal(&self, arousal_min: f64, arousal_max: f64) -> Result<Vec<MemoryEntry>> {
        self.select(
            "WHERE arousal IS NOT NULL AND arousal >= ?1 AND arousal <= ?2
             ORDER BY timestamp ASC",
            params![arousal_min, arousal_max],
        )
    }

    /// Most recent entries, newest first.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<MemoryEntry>> {
        self.select(
            "ORDER BY timestamp DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Substring search over content, then metadata while short of
    /// `n_results`. Matches record an access.
    pub fn search(&self, query: &str, n_results: usize) -> Result<Vec<ScoredEntry>> {
        if n_results == 0 {
            return Ok(Vec::new());
        }
        let needle = query.to_lowercase();

        let mut hits: Vec<ScoredEntry> = self
            .select(
                "WHERE instr(content_text, ?1) > 0 ORDER BY timestamp DESC LIMIT ?2",
                params![needle, n_results as i64],
            )?
            .into_iter()
            .map(|e| ScoredEntry::new(e, CONTENT_MATCH_SCORE))
            .collect();

        if hits.len() < n_results {
            // metadata_text is lowercased JSON; re-check against the typed map
            // so JSON punctuation never produces a hit
            let metadata_hits = self
                .select(
                    "WHERE instr(content_text, ?1) = 0 AND instr(metadata_text, ?1) > 0
                     ORDER BY timestamp DESC",
                    params![needle],
                )?
                .into_iter()
                .filter(|e| e.metadata_matches(&needle))
                .take(n_results - hits.len())
                .map(|e| ScoredEntry::new(e, METADATA_MATCH_SCORE));
            hits.extend(metadata_hits);
        }

        let now = self.clock.now();
        let now_text = format_datetime(&now);
        let ids: Vec<String> = hits.iter().map(|h| h.entry.id.to_string()).collect();
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute(
                    "UPDATE episodes SET access_count = access_count + 1, last_accessed = ?2
                     WHERE id = ?1",
                    params![id, now_text],
                )?;
            }
            tx.commit()
        })?;
        for hit in &mut hits {
            hit.entry.record_access(now);
        }

        Ok(hits)
    }

    pub fn remove(&self, id: &EntryId) -> Result<bool> {
        self.db.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM episodes WHERE id = ?1", params![id.as_str()])?;
            Ok(rows > 0)
        })
    }

    /// Remove the stored copy of `entry` only if it still has the same
    /// timestamp and content. A newer write under the same id is kept.
    pub fn remove_if_unchanged(&self, entry: &MemoryEntry) -> Result<bool> {
        self.db.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM episodes WHERE id = ?1 AND timestamp = ?2 AND content = ?3",
                params![
                    entry.id.as_str(),
                    format_datetime(&entry.timestamp),
                    content_to_sql(&entry.content),
                ],
            )?;
            Ok(rows > 0)
        })
    }

    /// Hold the connection lock for `duration`, stalling every other call.
    #[cfg(test)]
    pub(crate) fn stall(&self, duration: std::time::Duration) {
        let _ = self.db.with_conn(|_| {
            std::thread::sleep(duration);
            Ok(())
        });
    }

    pub fn get_stats(&self) -> Result<EpisodicStats> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp),
                        COUNT(valence), COALESCE(AVG(importance), 0.0)
                 FROM episodes",
                [],
                |row| {
                    Ok(EpisodicStats {
                        entry_count: row.get::<_, i64>(0)? as u64,
                        oldest: row.get::<_, Option<String>>(1)?.map(parse_datetime),
                        newest: row.get::<_, Option<String>>(2)?.map(parse_datetime),
                        with_valence: row.get::<_, i64>(3)? as u64,
                        average_importance: row.get(4)?,
                    })
                },
            )
        })
    }

    /// Release the backing connection. Safe to call more than once.
    pub fn close(&self) {
        if self.db.close() {
            info!("episodic memory closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.db.is_open()
    }

    fn select(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<MemoryEntry>> {
        let sql = format!("SELECT {} FROM episodes {}", ENTRY_COLUMNS, clause);
        let entries = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params, row_to_entry)?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            Ok(rows)
        })?;
        Ok(entries
            .into_iter()
            .map(|e| e.with_stage(Stage::Episodic))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::memory::types::{EMOTIONAL_AROUSAL_KEY, EMOTIONAL_VALENCE_KEY};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn episodic() -> (EpisodicMemory, ManualClock) {
        let clock = ManualClock::starting_now();
        let memory = EpisodicMemory::in_memory(Arc::new(clock.clone())).unwrap();
        (memory, clock)
    }

    #[test]
    fn test_store_and_get_roundtrip() {
        let (memory, clock) = episodic();
        let entry = MemoryEntry::new_at(json!({"event": "deploy", "ok": true}), clock.now())
            .with_importance(0.4)
            .with_metadata("source", "ci");

        assert!(memory.store(&entry).unwrap());
        clock.advance_secs(5);

        let fetched = memory.get_by_id(&entry.id).unwrap().unwrap();
        assert_eq!(fetched.content, entry.content);
        assert_eq!(fetched.metadata, entry.metadata);
        assert_eq!(fetched.timestamp, entry.timestamp);
        assert_eq!(fetched.access_count, 1);
        assert_eq!(fetched.last_accessed, clock.now());
        assert_eq!(fetched.stage, Some(Stage::Episodic));

        assert!(memory.get_by_id(&EntryId::from("missing")).unwrap().is_none());
    }

    #[test]
    fn test_temporal_window_is_inclusive_and_ordered() {
        let (memory, clock) = episodic();
        let start = clock.now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let entry = MemoryEntry::new_at(format!("event {}", i), start + Duration::seconds(i * 10));
            ids.push(entry.id.clone());
            memory.store(&entry).unwrap();
        }

        let window = memory
            .get_temporal_window(start + Duration::seconds(10), start + Duration::seconds(30))
            .unwrap();
        let got: Vec<EntryId> = window.into_iter().map(|e| e.id).collect();
        assert_eq!(got, ids[1..4].to_vec());
    }

    #[test]
    fn test_emotion_range_excludes_missing_valence() {
        let (memory, clock) = episodic();
        let happy = MemoryEntry::new_at("shipped release", clock.now())
            .with_metadata(EMOTIONAL_VALENCE_KEY, 0.8)
            .with_metadata(EMOTIONAL_AROUSAL_KEY, 0.9);
        let sad = MemoryEntry::new_at("build broke", clock.now())
            .with_metadata(EMOTIONAL_VALENCE_KEY, -0.6);
        let neutral = MemoryEntry::new_at("read docs", clock.now());
        for e in [&happy, &sad, &neutral] {
            memory.store(e).unwrap();
        }

        let positive = memory.get_by_emotion(0.0, 1.0).unwrap();
        assert_eq!(positive.len(), 1);
        assert_eq!(positive[0].id, happy.id);

        let all = memory.get_by_emotion(-1.0, 1.0).unwrap();
        assert_eq!(all.len(), 2);

        let aroused = memory.get_by_arousal(0.5, 1.0).unwrap();
        assert_eq!(aroused.len(), 1);
        assert_eq!(aroused[0].id, happy.id);

        assert_eq!(memory.get_stats().unwrap().with_valence, 2);
    }

    #[test]
    fn test_search_content_then_metadata() {
        let (memory, clock) = episodic();
        let by_content = MemoryEntry::new_at("Met the Payments team", clock.now());
        clock.advance_secs(1);
        let by_metadata =
            MemoryEntry::new_at("standup", clock.now()).with_metadata("team", "payments");
        let unrelated = MemoryEntry::new_at("lunch", clock.now()).with_metadata("team", "infra");
        for e in [&by_content, &by_metadata, &unrelated] {
            memory.store(e).unwrap();
        }

        let results = memory.search("PAYMENTS", 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].entry.id, by_content.id);
        assert_eq!(results[0].score, CONTENT_MATCH_SCORE);
        assert_eq!(results[1].entry.id, by_metadata.id);
        assert_eq!(results[1].score, METADATA_MATCH_SCORE);
        assert_eq!(results[0].entry.access_count, 1);

        // JSON punctuation alone never matches
        assert!(memory.search("\":\"", 10).unwrap().is_empty());
        assert_eq!(memory.search("payments", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_store_replaces_same_id() {
        let (memory, clock) = episodic();
        let first = MemoryEntry::new_at("v1", clock.now()).with_id("e1");
        let second = MemoryEntry::new_at("v2", clock.now()).with_id("e1");
        memory.store(&first).unwrap();
        memory.store(&second).unwrap();

        assert_eq!(memory.get_stats().unwrap().entry_count, 1);
        let fetched = memory.get_by_id(&EntryId::from("e1")).unwrap().unwrap();
        assert_eq!(fetched.content, json!("v2"));
    }

    #[test]
    fn test_remove_if_unchanged_spares_newer_write() {
        let (memory, clock) = episodic();
        let first = MemoryEntry::new_at("v1", clock.now()).with_id("e1");
        let second = MemoryEntry::new_at("v2", clock.now()).with_id("e1");
        memory.store(&first).unwrap();
        memory.store(&second).unwrap();

        assert!(!memory.remove_if_unchanged(&first).unwrap());
        assert_eq!(memory.get_stats().unwrap().entry_count, 1);

        // Importance and access bookkeeping do not count as a change
        memory.get_by_id(&second.id).unwrap();
        assert!(memory
            .remove_if_unchanged(&second.clone().with_importance(0.7))
            .unwrap());
        assert_eq!(memory.get_stats().unwrap().entry_count, 0);
    }

    #[test]
    fn test_recent_and_remove() {
        let (memory, clock) = episodic();
        for i in 0..3 {
            memory
                .store(&MemoryEntry::new_at(format!("e{}", i), clock.now()).with_id(format!("e{}", i)))
                .unwrap();
            clock.advance_secs(1);
        }

        let recent = memory.get_recent(2).unwrap();
        assert_eq!(recent[0].id, EntryId::from("e2"));
        assert_eq!(recent[1].id, EntryId::from("e1"));

        assert!(memory.remove(&EntryId::from("e2")).unwrap());
        assert!(!memory.remove(&EntryId::from("e2")).unwrap());
        assert_eq!(memory.get_stats().unwrap().entry_count, 2);
    }

    #[test]
    fn test_close_is_idempotent_and_fails_later_calls() {
        let (memory, clock) = episodic();
        memory.close();
        memory.close();
        assert!(!memory.is_open());

        let err = memory.store(&MemoryEntry::new_at("late", clock.now())).unwrap_err();
        assert!(err.is_backing_store());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episodic.db");
        let clock = ManualClock::starting_now();
        let entry = MemoryEntry::new_at("remember this", clock.now()).with_id("kept");

        {
            let memory = EpisodicMemory::open(&path, Arc::new(clock.clone())).unwrap();
            memory.store(&entry).unwrap();
            memory.close();
        }

        let memory = EpisodicMemory::open(&path, Arc::new(clock)).unwrap();
        assert!(memory.get_by_id(&entry.id).unwrap().is_some());
    }
}
