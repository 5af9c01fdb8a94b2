//! Semantic memory: concept and similarity indexed knowledge.
//!
//! Entries are embedded on write and persisted with their vectors in SQLite;
//! an in-process copy of the vectors serves nearest-neighbour search.
//! Indexing is best effort: embedder or storage failures are logged, counted
//! as degraded operations and surface as `false` or empty results, never as
//! errors.

use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::SemanticConfig;
use crate::error::{Error, Result};
use crate::memory::embedding::{cosine_similarity, Embedder, Tokenizer};
use crate::memory::sqlite::{
    blob_to_embedding, content_to_sql, embedding_to_blob, format_datetime, metadata_to_sql,
    row_to_entry, SqliteHandle, ENTRY_COLUMNS,
};
use crate::memory::types::{EntryId, MemoryEntry, MetadataValue, ScoredEntry, Stage};

/// Metadata keys consulted, in order, when deriving concepts.
const CONCEPT_KEYS: [&str; 4] = ["concept", "concepts", "tags", "domain"];

/// Minimum length of a content keyword used as a fallback concept.
const MIN_KEYWORD_LEN: usize = 4;

/// A concept cluster and how many entries belong to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    pub entry_count: u64,
}

/// Semantic memory statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticStats {
    pub entry_count: u64,
    pub concept_count: u64,
    pub indexed_vectors: usize,
    pub dimensions: usize,
    /// Store/search calls that failed and were degraded
    pub degraded_operations: u64,
}

struct IndexedVector {
    id: EntryId,
    embedding: Vec<f32>,
}

/// Similarity-searchable knowledge store.
pub struct SemanticMemory {
    db: SqliteHandle,
    embedder: Arc<dyn Embedder>,
    vectors: RwLock<Vec<IndexedVector>>,
    tokenizer: Tokenizer,
    min_similarity: f64,
    degraded: AtomicU64,
    clock: SharedClock,
}

impl SemanticMemory {
    /// Open or create a semantic store at `path`, loading its vectors.
    pub fn open(
        path: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
        config: &SemanticConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        let memory = Self::with_handle(
            SqliteHandle::open(Stage::Semantic, path)?,
            embedder,
            config,
            clock,
        );
        memory.load_vectors()?;
        Ok(memory)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(
        embedder: Arc<dyn Embedder>,
        config: &SemanticConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        Ok(Self::with_handle(
            SqliteHandle::in_memory(Stage::Semantic)?,
            embedder,
            config,
            clock,
        ))
    }

    fn with_handle(
        db: SqliteHandle,
        embedder: Arc<dyn Embedder>,
        config: &SemanticConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            db,
            embedder,
            vectors: RwLock::new(Vec::new()),
            tokenizer: Tokenizer::new(),
            min_similarity: config.min_similarity,
            degraded: AtomicU64::new(0),
            clock,
        }
    }

    fn load_vectors(&self) -> Result<()> {
        let loaded = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, embedding FROM semantic_entries")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(IndexedVector {
                        id: EntryId::from(row.get::<_, String>(0)?),
                        embedding: blob_to_embedding(&row.get::<_, Vec<u8>>(1)?),
                    })
                })?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            Ok(rows)
        })?;
        debug!(count = loaded.len(), "loaded semantic vectors");
        *self.vectors.write() = loaded;
        Ok(())
    }

    fn degrade(&self, operation: &str, err: &Error) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        warn!(operation, error = %err, "semantic index degraded");
    }

    /// Index an entry. Returns `false` if the index is unavailable.
    pub fn store(&self, entry: &MemoryEntry) -> bool {
        match self.try_store(entry) {
            Ok(()) => true,
            Err(e) => {
                self.degrade("store", &e);
                false
            }
        }
    }

    fn try_store(&self, entry: &MemoryEntry) -> Result<()> {
        let embedding = self.embedder.embed(&entry.content_text())?;
        if embedding.len() != self.embedder.dimensions() {
            return Err(Error::IndexDegraded(format!(
                "embedder returned {} dimensions, expected {}",
                embedding.len(),
                self.embedder.dimensions()
            )));
        }
        let concepts = self.derive_concepts(entry);

        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM semantic_concepts WHERE entry_id = ?1",
                params![entry.id.as_str()],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO semantic_entries (
                    id, content, metadata, importance, timestamp, last_accessed,
                    access_count, embedding
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id.as_str(),
                    content_to_sql(&entry.content),
                    metadata_to_sql(&entry.metadata),
                    entry.importance,
                    format_datetime(&entry.timestamp),
                    format_datetime(&entry.last_accessed),
                    entry.access_count as i64,
                    embedding_to_blob(&embedding),
                ],
            )?;
            for concept in &concepts {
                tx.execute(
                    "INSERT OR IGNORE INTO semantic_concepts (entry_id, concept) VALUES (?1, ?2)",
                    params![entry.id.as_str(), concept],
                )?;
            }
            tx.commit()
        })?;

        let mut vectors = self.vectors.write();
        match vectors.iter_mut().find(|v| v.id == entry.id) {
            Some(existing) => existing.embedding = embedding,
            None => vectors.push(IndexedVector {
                id: entry.id.clone(),
                embedding,
            }),
        }
        debug!(id = %entry.id, concepts = ?concepts, "indexed semantic entry");
        Ok(())
    }

    /// Nearest entries to `query` by cosine similarity, best first. Returns
    /// fewer than `n_results` when the index is sparse or degraded.
    pub fn search(&self, query: &str, n_results: usize) -> Vec<ScoredEntry> {
        if n_results == 0 {
            return Vec::new();
        }
        match self.try_search(query, n_results) {
            Ok(results) => results,
            Err(e) => {
                self.degrade("search", &e);
                Vec::new()
            }
        }
    }

    fn try_search(&self, query: &str, n_results: usize) -> Result<Vec<ScoredEntry>> {
        let query_vec = self.embedder.embed(query)?;

        let mut ranked: Vec<(EntryId, f64)> = {
            let vectors = self.vectors.read();
            vectors
                .iter()
                .map(|v| (v.id.clone(), cosine_similarity(&query_vec, &v.embedding)))
                .filter(|(_, score)| *score > 0.0 && *score >= self.min_similarity)
                .collect()
        };
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n_results);

        let now = self.clock.now();
        let now_text = format_datetime(&now);
        let sql = format!(
            "SELECT {} FROM semantic_entries WHERE id = ?1",
            ENTRY_COLUMNS
        );
        let entries = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut found = Vec::with_capacity(ranked.len());
            for (id, score) in &ranked {
                tx.execute(
                    "UPDATE semantic_entries SET access_count = access_count + 1,
                     last_accessed = ?2 WHERE id = ?1",
                    params![id.as_str(), now_text],
                )?;
                if let Some(entry) = tx
                    .query_row(&sql, params![id.as_str()], row_to_entry)
                    .optional()?
                {
                    found.push(ScoredEntry::new(entry.with_stage(Stage::Semantic), *score));
                }
            }
            tx.commit()?;
            Ok(found)
        })?;
        Ok(entries)
    }

    /// Distinct concepts with their entry counts, most populated first.
    pub fn get_concepts(&self) -> Vec<Concept> {
        let result = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT concept, COUNT(*) FROM semantic_concepts
                 GROUP BY concept ORDER BY COUNT(*) DESC, concept ASC",
            )?;
            let concepts = stmt
                .query_map([], |row| {
                    Ok(Concept {
                        name: row.get(0)?,
                        entry_count: row.get::<_, i64>(1)? as u64,
                    })
                })?
                .filter_map(|r| r.ok())
                .collect::<Vec<_>>();
            Ok(concepts)
        });
        match result {
            Ok(concepts) => concepts,
            Err(e) => {
                self.degrade("get_concepts", &e);
                Vec::new()
            }
        }
    }

    /// Concepts attached to one entry.
    pub fn concepts_for(&self, id: &EntryId) -> Vec<String> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT concept FROM semantic_concepts WHERE entry_id = ?1 ORDER BY concept",
                )?;
                let names = stmt
                    .query_map(params![id.as_str()], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect::<Vec<String>>();
                Ok(names)
            })
            .unwrap_or_default()
    }

    /// Get an entry by id, recording the access. `None` when absent or the
    /// index is unavailable.
    pub fn get_by_id(&self, id: &EntryId) -> Option<MemoryEntry> {
        let now = format_datetime(&self.clock.now());
        let result = self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE semantic_entries SET access_count = access_count + 1,
                 last_accessed = ?2 WHERE id = ?1",
                params![id.as_str(), now],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            conn.query_row(
                &format!("SELECT {} FROM semantic_entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id.as_str()],
                row_to_entry,
            )
            .optional()
        });
        match result {
            Ok(entry) => entry.map(|e| e.with_stage(Stage::Semantic)),
            Err(e) => {
                self.degrade("get_by_id", &e);
                None
            }
        }
    }

    pub fn remove(&self, id: &EntryId) -> bool {
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM semantic_concepts WHERE entry_id = ?1",
                params![id.as_str()],
            )?;
            let rows = conn.execute(
                "DELETE FROM semantic_entries WHERE id = ?1",
                params![id.as_str()],
            )?;
            Ok(rows > 0)
        });
        match result {
            Ok(removed) => {
                if removed {
                    self.vectors.write().retain(|v| &v.id != id);
                }
                removed
            }
            Err(e) => {
                self.degrade("remove", &e);
                false
            }
        }
    }

    pub fn get_stats(&self) -> SemanticStats {
        let counts = self.db.with_conn(|conn| {
            let entries: i64 =
                conn.query_row("SELECT COUNT(*) FROM semantic_entries", [], |r| r.get(0))?;
            let concepts: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT concept) FROM semantic_concepts",
                [],
                |r| r.get(0),
            )?;
            Ok((entries as u64, concepts as u64))
        });
        let (entry_count, concept_count) = match counts {
            Ok(c) => c,
            Err(e) => {
                self.degrade("get_stats", &e);
                (0, 0)
            }
        };

        SemanticStats {
            entry_count,
            concept_count,
            indexed_vectors: self.vectors.read().len(),
            dimensions: self.embedder.dimensions(),
            degraded_operations: self.degraded.load(Ordering::Relaxed),
        }
    }

    /// Whether the backing index is open.
    pub fn is_available(&self) -> bool {
        self.db.is_open()
    }

    /// Drop the backing connection; later operations degrade.
    pub fn close(&self) {
        self.db.close();
    }

    /// Concepts for an entry: explicit metadata first, else the dominant
    /// content keyword.
    fn derive_concepts(&self, entry: &MemoryEntry) -> Vec<String> {
        let mut concepts: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            let name = name.trim().to_lowercase();
            if !name.is_empty() && !concepts.contains(&name) {
                concepts.push(name);
            }
        };

        for key in CONCEPT_KEYS {
            match entry.get_metadata(key) {
                Some(MetadataValue::String(s)) => push(s),
                Some(MetadataValue::List(items)) => {
                    for item in items {
                        if let Some(s) = item.as_str() {
                            push(s);
                        }
                    }
                }
                _ => {}
            }
        }

        if concepts.is_empty() {
            if let Some(keyword) = self
                .tokenizer
                .top_keyword(&entry.content_text(), MIN_KEYWORD_LEN)
            {
                concepts.push(keyword);
            }
        }
        concepts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::memory::embedding::HashingEmbedder;
    use pretty_assertions::assert_eq;

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::IndexDegraded("embedding service offline".into()))
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    fn semantic() -> (SemanticMemory, ManualClock) {
        let clock = ManualClock::starting_now();
        let memory = SemanticMemory::in_memory(
            Arc::new(HashingEmbedder::new(256)),
            &SemanticConfig::default(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (memory, clock)
    }

    #[test]
    fn test_similarity_search_ranks_closest_first() {
        let (memory, clock) = semantic();
        let pooling = MemoryEntry::new_at("Postgres connection pooling with pgbouncer", clock.now());
        let indexes = MemoryEntry::new_at("Postgres indexes speed up lookups", clock.now());
        let party = MemoryEntry::new_at("Birthday party on Friday", clock.now());
        for e in [&pooling, &indexes, &party] {
            assert!(memory.store(e));
        }

        let results = memory.search("postgres connection pooling", 10);
        assert!(!results.is_empty());
        assert_eq!(results[0].entry.id, pooling.id);
        assert_eq!(results[0].entry.stage, Some(Stage::Semantic));
        assert_eq!(results[0].entry.access_count, 1);
        assert!(results.iter().all(|r| r.entry.id != party.id));
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_sparse_index_returns_fewer_results() {
        let (memory, clock) = semantic();
        memory.store(&MemoryEntry::new_at("tokio runtime internals", clock.now()));

        assert_eq!(memory.search("tokio runtime", 5).len(), 1);
        assert!(memory.search("gardening tips", 5).is_empty());
        assert!(memory.search("tokio", 0).is_empty());
    }

    #[test]
    fn test_concepts_from_metadata_and_keywords() {
        let (memory, clock) = semantic();
        memory.store(
            &MemoryEntry::new_at("JWT tokens expire hourly", clock.now())
                .with_metadata("tags", vec!["Security", "auth"]),
        );
        memory.store(
            &MemoryEntry::new_at("OAuth refresh flow", clock.now()).with_metadata("domain", "auth"),
        );
        memory.store(&MemoryEntry::new_at(
            "Borrowing rules: borrowing is checked at compile time",
            clock.now(),
        ));

        let concepts = memory.get_concepts();
        assert_eq!(
            concepts,
            vec![
                Concept { name: "auth".into(), entry_count: 2 },
                Concept { name: "borrowing".into(), entry_count: 1 },
                Concept { name: "security".into(), entry_count: 1 },
            ]
        );
        assert_eq!(memory.get_stats().concept_count, 3);
    }

    #[test]
    fn test_restore_replaces_vector_and_concepts() {
        let (memory, clock) = semantic();
        let first = MemoryEntry::new_at("kubernetes pods", clock.now())
            .with_id("k")
            .with_metadata("concept", "containers");
        let second = MemoryEntry::new_at("helm charts", clock.now())
            .with_id("k")
            .with_metadata("concept", "packaging");
        memory.store(&first);
        memory.store(&second);

        let stats = memory.get_stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.indexed_vectors, 1);
        assert_eq!(memory.concepts_for(&EntryId::from("k")), vec!["packaging"]);
        assert!(memory.search("kubernetes pods", 5).is_empty());
        assert_eq!(memory.search("helm charts", 5).len(), 1);
    }

    #[test]
    fn test_embedder_failure_degrades_without_error() {
        let clock = ManualClock::starting_now();
        let memory = SemanticMemory::in_memory(
            Arc::new(FailingEmbedder),
            &SemanticConfig::default(),
            Arc::new(clock.clone()),
        )
        .unwrap();

        assert!(!memory.store(&MemoryEntry::new_at("anything", clock.now())));
        assert!(memory.search("anything", 5).is_empty());
        assert!(memory.get_concepts().is_empty());
        assert_eq!(memory.get_stats().degraded_operations, 2);
    }

    #[test]
    fn test_closed_index_degrades() {
        let (memory, clock) = semantic();
        let entry = MemoryEntry::new_at("cached fact", clock.now());
        memory.store(&entry);
        memory.close();

        assert!(!memory.is_available());
        assert!(!memory.store(&MemoryEntry::new_at("late fact", clock.now())));
        assert!(memory.search("cached fact", 5).is_empty());
        assert!(memory.get_by_id(&entry.id).is_none());
        assert!(memory.get_concepts().is_empty());
    }

    #[test]
    fn test_get_by_id_and_remove() {
        let (memory, clock) = semantic();
        let entry = MemoryEntry::new_at("vector clocks order events", clock.now());
        memory.store(&entry);

        let fetched = memory.get_by_id(&entry.id).unwrap();
        assert_eq!(fetched.content, entry.content);
        assert_eq!(fetched.access_count, 1);

        assert!(memory.remove(&entry.id));
        assert!(!memory.remove(&entry.id));
        assert!(memory.get_by_id(&entry.id).is_none());
        assert!(memory.get_concepts().is_empty());
        assert_eq!(memory.get_stats().indexed_vectors, 0);
    }

    #[test]
    fn test_vectors_reload_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("semantic.db");
        let clock = ManualClock::starting_now();
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(128));

        {
            let memory = SemanticMemory::open(
                &path,
                Arc::clone(&embedder),
                &SemanticConfig::default(),
                Arc::new(clock.clone()),
            )
            .unwrap();
            memory.store(&MemoryEntry::new_at("raft leader election", clock.now()));
        }

        let memory =
            SemanticMemory::open(&path, embedder, &SemanticConfig::default(), Arc::new(clock))
                .unwrap();
        assert_eq!(memory.get_stats().indexed_vectors, 1);
        assert_eq!(memory.search("leader election", 3).len(), 1);
    }
}
