//! Unified entry point over the four tiers.
//!
//! [`MemorySystem`] routes each store to exactly one tier by importance,
//! fans searches out to every tier concurrently and keeps facade-level
//! counters. A tier that fails or times out degrades the result of a single
//! call; it never takes the other tiers down with it.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::MemoryConfig;
use crate::consolidation::{ConsolidationEngine, ConsolidationReport, ConsolidationScheduler};
use crate::error::{Error, Result};
use crate::memory::{
    Embedder, EntryId, EpisodicStats, HashingEmbedder, MemoryEntry, Metadata, PersistentStats,
    ScoredEntry, SemanticStats, Stage, WorkingStats, CONTENT_MATCH_SCORE,
};
use crate::routing::RoutingTable;
use crate::tiers::Tiers;

/// A search hit tagged with the tier that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedEntry {
    pub entry: MemoryEntry,
    pub stage: Stage,
    pub score: f64,
}

/// Aggregate statistics. A tier's stats are `None` when its call failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySystemStats {
    pub working: Option<WorkingStats>,
    pub episodic: Option<EpisodicStats>,
    pub semantic: Option<SemanticStats>,
    pub persistent: Option<PersistentStats>,
    /// Facade calls of any kind
    pub total_operations: u64,
    /// Successful stores
    pub total_stores: u64,
    /// Successful stores per tier
    pub stage_distribution: BTreeMap<Stage, u64>,
    /// Mean importance over successful stores
    pub average_importance: f64,
    /// Failed or timed-out tier calls per tier
    pub tier_failures: BTreeMap<Stage, u64>,
    /// Tiers that returned results for the last retrieve
    pub last_retrieve_stages: Vec<Stage>,
}

#[derive(Debug, Default)]
struct FacadeCounters {
    total_operations: u64,
    total_stores: u64,
    importance_sum: f64,
    stage_distribution: BTreeMap<Stage, u64>,
    tier_failures: BTreeMap<Stage, u64>,
    last_retrieve_stages: Vec<Stage>,
}

impl FacadeCounters {
    fn record_failure(&mut self, stage: Stage) {
        *self.tier_failures.entry(stage).or_insert(0) += 1;
    }
}

/// The tiered memory system.
pub struct MemorySystem {
    config: MemoryConfig,
    tiers: Arc<Tiers>,
    routing: RoutingTable,
    engine: Arc<ConsolidationEngine>,
    clock: SharedClock,
    counters: Mutex<FacadeCounters>,
    scheduler: Mutex<Option<ConsolidationScheduler>>,
}

impl MemorySystem {
    /// Build a memory system using the wall clock and the hashing embedder.
    pub fn new(config: MemoryConfig) -> Result<Self> {
        Self::with_clock(config, system_clock())
    }

    /// Build a memory system with an injected clock.
    pub fn with_clock(config: MemoryConfig, clock: SharedClock) -> Result<Self> {
        let embedder = Arc::new(HashingEmbedder::new(config.semantic.dimensions));
        Self::with_embedder(config, clock, embedder)
    }

    /// Build a memory system with an injected clock and embedding service.
    pub fn with_embedder(
        config: MemoryConfig,
        clock: SharedClock,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        config.validate()?;
        let routing = RoutingTable::from_thresholds(&config.routing.thresholds)?;
        let tiers = Arc::new(Tiers::open(&config, Arc::clone(&clock), embedder)?);
        let engine = Arc::new(ConsolidationEngine::new(
            Arc::clone(&tiers),
            routing.clone(),
            &config.consolidation,
        ));

        info!(
            working_bytes = config.working.max_size_bytes(),
            policy = %config.working.eviction_policy,
            persistent = config.storage.data_dir.is_some(),
            "memory system ready"
        );

        Ok(Self {
            config,
            tiers,
            routing,
            engine,
            clock,
            counters: Mutex::new(FacadeCounters::default()),
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn tiers(&self) -> &Arc<Tiers> {
        &self.tiers
    }

    /// Store new content, routed by `importance`. Returns the new id.
    pub async fn store(
        &self,
        content: impl Into<Value>,
        metadata: Metadata,
        importance: f64,
    ) -> Result<EntryId> {
        let entry = MemoryEntry::new_at(content, self.clock.now())
            .with_metadata_map(metadata)
            .with_importance(importance);
        self.store_entry(entry).await
    }

    /// Store a caller-built entry, routed by its importance.
    ///
    /// An entry the semantic index cannot take is written to episodic memory
    /// instead and the index failure is counted under `tier_failures`.
    #[instrument(skip(self, entry), fields(id = %entry.id, importance = entry.importance))]
    pub async fn store_entry(&self, entry: MemoryEntry) -> Result<EntryId> {
        self.counters.lock().total_operations += 1;

        let stage = self.routing.route(entry.importance);
        let id = entry.id.clone();
        let importance = entry.importance;

        let fallback = (stage == Stage::Semantic).then(|| entry.clone());
        let mut landed = stage;
        let mut result = self.write_to(stage, entry).await;
        if let Some(entry) = fallback {
            if let Err(e) = result {
                warn!(error = %e, "semantic index unavailable, storing in episodic memory");
                self.counters.lock().record_failure(Stage::Semantic);
                landed = Stage::Episodic;
                result = self.write_to(Stage::Episodic, entry).await;
            }
        }

        let mut counters = self.counters.lock();
        match result {
            Ok(()) => {
                counters.total_stores += 1;
                counters.importance_sum += importance;
                *counters.stage_distribution.entry(landed).or_insert(0) += 1;
                debug!(stage = %landed, "stored entry");
                Ok(id)
            }
            Err(e) => {
                counters.record_failure(landed);
                warn!(stage = %landed, error = %e, "store failed");
                Err(e)
            }
        }
    }

    async fn write_to(&self, stage: Stage, entry: MemoryEntry) -> Result<()> {
        match stage {
            Stage::Working => {
                let size = entry.approx_size_bytes();
                if self.tiers.working.store(entry) {
                    Ok(())
                } else {
                    Err(Error::capacity_exceeded(size, self.tiers.working.capacity()))
                }
            }
            Stage::Episodic => self
                .tiers
                .with_episodic(move |tier| tier.store(&entry))
                .await
                .and_then(|stored| acknowledged(stored, Stage::Episodic)),
            Stage::Semantic => self
                .tiers
                .with_semantic(move |tier| Ok(tier.store(&entry)))
                .await
                .and_then(|indexed| {
                    if indexed {
                        Ok(())
                    } else {
                        Err(Error::IndexDegraded("semantic index rejected entry".into()))
                    }
                }),
            Stage::Persistent => self
                .tiers
                .with_persistent(move |tier| tier.store(&entry))
                .await
                .and_then(|stored| acknowledged(stored, Stage::Persistent)),
        }
    }

    /// Search every tier concurrently and merge the hits.
    ///
    /// Tiers score on different scales, so hits are ranked by match
    /// strength first (content or similarity matches above metadata-only
    /// matches), then by tier, highest first, then by the tier's own score.
    /// `score` on each result is the tier's score. Tiers that fail or time
    /// out contribute nothing.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, query: &str, n_results: usize) -> Vec<RetrievedEntry> {
        self.counters.lock().total_operations += 1;
        if n_results == 0 {
            return Vec::new();
        }

        let _observe = self.tiers.observe().await;
        let searches = Stage::ALL
            .iter()
            .map(|&stage| self.search_tier(stage, query.to_string(), n_results));
        let outcomes = join_all(searches).await;

        let mut merged = Vec::new();
        let mut contributors = Vec::new();
        let mut failed = Vec::new();
        for (stage, outcome) in outcomes {
            match outcome {
                Ok(hits) => {
                    if !hits.is_empty() {
                        contributors.push(stage);
                    }
                    merged.extend(hits.into_iter().map(|hit| RetrievedEntry {
                        entry: hit.entry.with_stage(stage),
                        stage,
                        score: hit.score,
                    }));
                }
                Err(e) => {
                    warn!(%stage, error = %e, "tier search failed");
                    failed.push(stage);
                }
            }
        }

        merged.sort_by(|a, b| {
            match_strength(b)
                .cmp(&match_strength(a))
                .then_with(|| b.stage.rank().cmp(&a.stage.rank()))
                .then_with(|| b.score.total_cmp(&a.score))
        });
        merged.truncate(n_results);

        let mut counters = self.counters.lock();
        for stage in failed {
            counters.record_failure(stage);
        }
        debug!(results = merged.len(), contributors = ?contributors, "retrieve complete");
        counters.last_retrieve_stages = contributors;
        merged
    }

    async fn search_tier(
        &self,
        stage: Stage,
        query: String,
        n_results: usize,
    ) -> (Stage, Result<Vec<ScoredEntry>>) {
        let outcome = match stage {
            Stage::Working => Ok(self.tiers.working.search(&query, n_results)),
            Stage::Episodic => {
                self.tiers
                    .with_episodic(move |tier| tier.search(&query, n_results))
                    .await
            }
            Stage::Semantic => {
                self.tiers
                    .with_semantic(move |tier| Ok(tier.search(&query, n_results)))
                    .await
            }
            Stage::Persistent => {
                self.tiers
                    .with_persistent(move |tier| tier.search(&query, n_results))
                    .await
            }
        };
        (stage, outcome)
    }

    /// Look an id up, highest tier first.
    ///
    /// Tier failures are skipped; if nothing is found and a tier failed, the
    /// first failure is returned.
    pub async fn get_by_id(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        self.counters.lock().total_operations += 1;
        let _observe = self.tiers.observe().await;
        let mut first_error = None;

        for stage in Stage::ALL.iter().rev().copied() {
            let lookup = id.clone();
            let found = match stage {
                Stage::Persistent => {
                    self.tiers
                        .with_persistent(move |tier| tier.get_by_id(&lookup))
                        .await
                }
                Stage::Semantic => {
                    self.tiers
                        .with_semantic(move |tier| Ok(tier.get_by_id(&lookup)))
                        .await
                }
                Stage::Episodic => {
                    self.tiers
                        .with_episodic(move |tier| tier.get_by_id(&lookup))
                        .await
                }
                Stage::Working => Ok(self.tiers.working.get_by_id(&lookup)),
            };

            match found {
                Ok(Some(entry)) => return Ok(Some(entry.with_stage(stage))),
                Ok(None) => {}
                Err(e) => {
                    warn!(%id, %stage, error = %e, "lookup failed");
                    self.counters.lock().record_failure(stage);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Remove an id from every tier. Returns whether any tier held it.
    pub async fn remove(&self, id: &EntryId) -> Result<bool> {
        self.counters.lock().total_operations += 1;

        let mut removed = self.tiers.working.remove(id);
        let mut first_error = None;

        let lookup = id.clone();
        let episodic = self.tiers.with_episodic(move |t| t.remove(&lookup)).await;
        let lookup = id.clone();
        let semantic = self.tiers.with_semantic(move |t| Ok(t.remove(&lookup))).await;
        let lookup = id.clone();
        let persistent = self.tiers.with_persistent(move |t| t.remove(&lookup)).await;

        for (stage, outcome) in [
            (Stage::Episodic, episodic),
            (Stage::Semantic, semantic),
            (Stage::Persistent, persistent),
        ] {
            match outcome {
                Ok(hit) => removed |= hit,
                Err(e) => {
                    self.counters.lock().record_failure(stage);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if !removed => Err(e),
            _ => Ok(removed),
        }
    }

    /// Run one consolidation pass now.
    pub async fn consolidate(&self) -> ConsolidationReport {
        self.counters.lock().total_operations += 1;
        self.engine.tick().await
    }

    pub async fn get_stats(&self) -> MemorySystemStats {
        let episodic = self.tiers.with_episodic(|t| t.get_stats()).await.ok();
        let semantic = self.tiers.with_semantic(|t| Ok(t.get_stats())).await.ok();
        let persistent = self.tiers.with_persistent(|t| t.get_stats()).await.ok();

        let counters = self.counters.lock();
        MemorySystemStats {
            working: Some(self.tiers.working.get_stats()),
            episodic,
            semantic,
            persistent,
            total_operations: counters.total_operations,
            total_stores: counters.total_stores,
            stage_distribution: counters.stage_distribution.clone(),
            average_importance: if counters.total_stores == 0 {
                0.0
            } else {
                counters.importance_sum / counters.total_stores as f64
            },
            tier_failures: counters.tier_failures.clone(),
            last_retrieve_stages: counters.last_retrieve_stages.clone(),
        }
    }

    /// Start background consolidation on the current tokio runtime.
    /// Returns false if it is already running.
    pub fn start_background(&self) -> bool {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return false;
        }
        *scheduler = Some(ConsolidationScheduler::spawn(
            Arc::clone(&self.engine),
            &self.config.consolidation,
        ));
        true
    }

    pub fn is_background_running(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .map(|s| s.is_running())
            .unwrap_or(false)
    }

    /// Stop background consolidation and close the durable tiers.
    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        self.tiers.close();
        info!("memory system shut down");
    }
}

/// 1 for content and similarity hits, 0 for metadata-only hits.
fn match_strength(hit: &RetrievedEntry) -> u8 {
    match hit.stage {
        Stage::Semantic => 1,
        _ if hit.score >= CONTENT_MATCH_SCORE => 1,
        _ => 0,
    }
}

fn acknowledged(stored: bool, stage: Stage) -> Result<()> {
    if stored {
        Ok(())
    } else {
        Err(Error::backing_store(stage, "write not acknowledged"))
    }
}
