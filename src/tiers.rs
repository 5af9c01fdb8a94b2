//! Shared handles to the four tiers.
//!
//! Durable tiers do blocking SQLite I/O, so async callers go through
//! [`Tiers::with_episodic`] and friends, which run the call on the blocking
//! pool and bound it by the configured tier timeout.
//!
//! Cross-tier readers hold [`Tiers::observe`] for the whole lookup and
//! consolidation holds [`Tiers::evicting`] while dropping a migrated entry
//! from its source tier, so a reader sees an entry in flight in its old tier
//! or its new one.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::memory::{
    Embedder, EpisodicMemory, PersistentMemory, SemanticMemory, Stage, WorkingMemory,
};

/// File names of the durable tiers inside `storage.data_dir`.
pub const EPISODIC_DB: &str = "episodic.db";
pub const SEMANTIC_DB: &str = "semantic.db";
pub const PERSISTENT_DB: &str = "persistent.db";

/// The tier set owned by one memory system.
pub struct Tiers {
    pub working: Arc<WorkingMemory>,
    pub episodic: Arc<EpisodicMemory>,
    pub semantic: Arc<SemanticMemory>,
    pub persistent: Arc<PersistentMemory>,
    timeout: Duration,
    gate: RwLock<()>,
}

impl Tiers {
    /// Build every tier from `config`. Durable tiers live under
    /// `storage.data_dir` when set, otherwise in memory.
    pub fn open(
        config: &MemoryConfig,
        clock: SharedClock,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let working = WorkingMemory::from_config(&config.working, Arc::clone(&clock));

        let (episodic, semantic, persistent) = match &config.storage.data_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                info!(data_dir = %dir.display(), "opening durable tiers");
                (
                    EpisodicMemory::open(dir.join(EPISODIC_DB), Arc::clone(&clock))?,
                    SemanticMemory::open(
                        dir.join(SEMANTIC_DB),
                        embedder,
                        &config.semantic,
                        Arc::clone(&clock),
                    )?,
                    PersistentMemory::open(dir.join(PERSISTENT_DB), clock)?,
                )
            }
            None => (
                EpisodicMemory::in_memory(Arc::clone(&clock))?,
                SemanticMemory::in_memory(embedder, &config.semantic, Arc::clone(&clock))?,
                PersistentMemory::in_memory(clock)?,
            ),
        };

        Ok(Self {
            working: Arc::new(working),
            episodic: Arc::new(episodic),
            semantic: Arc::new(semantic),
            persistent: Arc::new(persistent),
            timeout: config.storage.tier_timeout(),
            gate: RwLock::new(()),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Shared guard for a lookup spanning several tiers.
    pub async fn observe(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Exclusive guard for removing an entry from its source tier once its
    /// destination write is confirmed. Waits for in-flight lookups.
    pub async fn evicting(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    pub async fn with_episodic<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&EpisodicMemory) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tier = Arc::clone(&self.episodic);
        run_blocking(Stage::Episodic, self.timeout, move || f(&tier)).await
    }

    pub async fn with_semantic<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SemanticMemory) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tier = Arc::clone(&self.semantic);
        run_blocking(Stage::Semantic, self.timeout, move || f(&tier)).await
    }

    pub async fn with_persistent<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&PersistentMemory) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tier = Arc::clone(&self.persistent);
        run_blocking(Stage::Persistent, self.timeout, move || f(&tier)).await
    }

    /// Close the durable tiers. Safe to call more than once.
    pub fn close(&self) {
        self.episodic.close();
        self.semantic.close();
        self.persistent.close();
    }
}

/// Run a blocking tier call, failing with `Timeout` if it overruns `limit`.
///
/// A timed-out call keeps running on the blocking pool; its result is
/// discarded.
async fn run_blocking<T, F>(stage: Stage, limit: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(Error::backing_store(
            stage,
            format!("tier task failed: {}", join_err),
        )),
        Err(_) => {
            warn!(%stage, timeout_ms = limit.as_millis() as u64, "tier call timed out");
            Err(Error::timeout(limit.as_millis() as u64))
        }
    }
}
