//! Tiered memory stores.
//!
//! Entries move up through four tiers as their importance grows:
//!
//! - **Working**: bounded in-process cache with TTL and eviction
//! - **Episodic**: time-ordered experiences with emotional tags (SQLite)
//! - **Semantic**: concept and similarity indexed knowledge (SQLite + vectors)
//! - **Persistent**: append-only versioned storage for critical entries (SQLite)
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tiered_memory::clock::system_clock;
//! use tiered_memory::memory::{EpisodicMemory, MemoryEntry};
//!
//! let episodic = EpisodicMemory::in_memory(system_clock())?;
//!
//! let entry = MemoryEntry::new("deployed v2 to staging")
//!     .with_metadata("emotional_valence", 0.6);
//! episodic.store(&entry)?;
//!
//! let happy = episodic.get_by_emotion(0.5, 1.0)?;
//! ```

mod embedding;
mod episodic;
mod persistent;
mod schema;
mod semantic;
pub(crate) mod sqlite;
pub(crate) mod types;
pub(crate) mod working;

#[cfg(test)]
mod proptest;

pub use embedding::{cosine_similarity, is_stop_word, Embedder, HashingEmbedder, Tokenizer};
pub use episodic::{EpisodicMemory, EpisodicStats};
pub use persistent::{EntryVersion, PersistentMemory, PersistentStats};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use semantic::{Concept, SemanticMemory, SemanticStats};
pub use types::{
    EntryId, MemoryEntry, Metadata, MetadataValue, ScoredEntry, Stage, CONTENT_MATCH_SCORE,
    EMOTIONAL_AROUSAL_KEY, EMOTIONAL_VALENCE_KEY, METADATA_MATCH_SCORE,
};
pub use working::{EvictionPolicy, WorkingMemory, WorkingStats};
