//! # tiered-memory
//!
//! A four-tier memory hierarchy for agent runtimes: entries are routed by
//! importance into working, episodic, semantic or persistent memory and
//! migrate upward as they age.
//!
//! ## Core Components
//!
//! - **Memory**: the four tier stores and the shared entry model
//! - **Routing**: ordered importance thresholds mapping entries to tiers
//! - **Consolidation**: confirm-then-evict migration and its background scheduler
//! - **Facade**: [`MemorySystem`], the single entry point
//!
//! ## Example
//!
//! ```rust,ignore
//! use tiered_memory::{MemoryConfig, MemorySystem, Metadata};
//!
//! let memory = MemorySystem::new(MemoryConfig::load("memory.toml")?)?;
//! memory.start_background();
//!
//! let id = memory
//!     .store("Production database fails over in 30s", Metadata::new(), 0.95)
//!     .await?;
//!
//! for hit in memory.retrieve("database failover", 5).await {
//!     println!("{} [{}] {:.2}", hit.entry.id, hit.stage, hit.score);
//! }
//!
//! memory.shutdown().await;
//! ```

pub mod clock;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod facade;
pub mod memory;
pub mod routing;
pub mod tiers;

// Re-exports for convenience
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    ConsolidationConfig, MemoryConfig, RoutingConfig, SemanticConfig, StorageConfig,
    WorkingConfig,
};
pub use consolidation::{ConsolidationEngine, ConsolidationReport, ConsolidationScheduler};
pub use error::{Error, Result};
pub use facade::{MemorySystem, MemorySystemStats, RetrievedEntry};
pub use memory::{
    Concept, Embedder, EntryId, EntryVersion, EpisodicMemory, EvictionPolicy, HashingEmbedder,
    MemoryEntry, Metadata, MetadataValue, PersistentMemory, ScoredEntry, SemanticMemory, Stage,
    WorkingMemory,
};
pub use routing::{Route, RoutingTable, DEFAULT_THRESHOLDS};
pub use tiers::Tiers;
