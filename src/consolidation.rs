//! Consolidation: migrating aged entries up the tier hierarchy.
//!
//! Every move is confirm-then-evict: an entry is removed from its source tier
//! only after the destination tier has acknowledged the write. An entry may
//! briefly live in two tiers but is never in none.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::ConsolidationConfig;
use crate::error::{Error, Result};
use crate::memory::{EntryId, MemoryEntry, Stage};
use crate::routing::RoutingTable;
use crate::tiers::Tiers;

/// Outcome of one consolidation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Working-memory entries eligible this pass
    pub candidates: usize,
    /// Moved into episodic memory and evicted from working memory
    pub migrated: usize,
    /// Left in working memory after a failed episodic write
    pub failed: usize,
    /// Moved on from episodic into semantic or persistent memory
    pub promoted: usize,
    /// Written to episodic memory but left in working memory because the
    /// working entry was stored again or dropped meanwhile
    pub superseded: usize,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl ConsolidationReport {
    fn record_error(&mut self, id: &EntryId, err: &Error) {
        self.errors.push(format!("{}: {}", id, err));
    }
}

/// Runs consolidation passes over a tier set.
pub struct ConsolidationEngine {
    tiers: Arc<Tiers>,
    routing: RoutingTable,
    access_boost: f64,
    // Serializes passes from the scheduler and manual calls
    pass: Mutex<()>,
}

impl ConsolidationEngine {
    pub fn new(tiers: Arc<Tiers>, routing: RoutingTable, config: &ConsolidationConfig) -> Self {
        Self {
            tiers,
            routing,
            access_boost: config.access_boost,
            pass: Mutex::new(()),
        }
    }

    pub fn tiers(&self) -> &Arc<Tiers> {
        &self.tiers
    }

    /// Importance after crediting the entry's recorded accesses, capped at 1.
    pub fn revised_importance(&self, entry: &MemoryEntry) -> f64 {
        (entry.importance + self.access_boost * entry.access_count as f64).min(1.0)
    }

    /// Run one pass.
    ///
    /// Candidates come from working memory and are written to episodic
    /// memory; those whose revised importance routes above episodic are then
    /// written onward and evicted from episodic. Failures are recorded in the
    /// report and leave the entry where it was. A source copy that changed
    /// while its write was in flight is left in place.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> ConsolidationReport {
        let _pass = self.pass.lock().await;
        let started = Instant::now();

        let candidates = self.tiers.working.consolidation_snapshot();
        let mut report = ConsolidationReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for (candidate, inserted) in candidates {
            let id = candidate.id.clone();

            if let Err(e) = self.migrate_to_episodic(&candidate).await {
                warn!(%id, error = %e, "episodic write failed, keeping entry in working memory");
                report.failed += 1;
                report.record_error(&id, &e);
                continue;
            }

            let evicted = {
                let _gate = self.tiers.evicting().await;
                self.tiers.working.remove_if_unchanged(&id, inserted)
            };
            if !evicted {
                debug!(%id, "working entry changed during migration, leaving it in place");
                report.superseded += 1;
                continue;
            }
            report.migrated += 1;

            let revised = self.revised_importance(&candidate);
            let target = self.routing.route(revised);
            if target <= Stage::Episodic {
                continue;
            }

            match self.promote(target, candidate.clone().with_importance(revised)).await {
                Ok(()) => {
                    report.promoted += 1;
                    debug!(%id, %target, revised, "promoted entry");
                    let evicted = {
                        let _gate = self.tiers.evicting().await;
                        self.tiers
                            .with_episodic(move |tier| tier.remove_if_unchanged(&candidate))
                            .await
                    };
                    match evicted {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(%id, "episodic entry replaced during promotion, keeping it");
                        }
                        Err(e) => {
                            // Entry now lives in both tiers
                            warn!(%id, error = %e, "could not evict promoted entry from episodic memory");
                            report.record_error(&id, &e);
                        }
                    }
                }
                Err(e) => {
                    warn!(%id, %target, error = %e, "promotion failed, entry stays in episodic memory");
                    report.record_error(&id, &e);
                }
            }
        }

        report.duration = started.elapsed();
        if report.candidates > 0 {
            info!(
                candidates = report.candidates,
                migrated = report.migrated,
                failed = report.failed,
                promoted = report.promoted,
                superseded = report.superseded,
                duration_ms = report.duration.as_millis() as u64,
                "consolidation pass complete"
            );
        }
        report
    }

    async fn migrate_to_episodic(&self, entry: &MemoryEntry) -> Result<()> {
        let entry = entry.clone();
        let stored = self.tiers.with_episodic(move |tier| tier.store(&entry)).await?;
        if stored {
            Ok(())
        } else {
            Err(Error::backing_store(Stage::Episodic, "write not acknowledged"))
        }
    }

    async fn promote(&self, target: Stage, entry: MemoryEntry) -> Result<()> {
        match target {
            Stage::Semantic => {
                let indexed = self.tiers.with_semantic(move |tier| Ok(tier.store(&entry))).await?;
                if indexed {
                    Ok(())
                } else {
                    Err(Error::IndexDegraded("semantic index rejected entry".into()))
                }
            }
            Stage::Persistent => {
                self.tiers
                    .with_persistent(move |tier| tier.store(&entry))
                    .await?;
                Ok(())
            }
            Stage::Working | Stage::Episodic => Ok(()),
        }
    }
}

/// Background task running consolidation and expiry sweeps on timers.
///
/// Consolidation runs every `interval_seconds`. Expiry sweeps run every
/// `cleanup_interval_seconds`; if working-memory pressure is above
/// `pressure_high_water` after a sweep, a consolidation pass runs straight
/// away. Dropping the scheduler also stops the task.
pub struct ConsolidationScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConsolidationScheduler {
    /// Spawn the scheduler on the current tokio runtime.
    pub fn spawn(engine: Arc<ConsolidationEngine>, config: &ConsolidationConfig) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let consolidate_every = config.interval();
        let cleanup_every = config.cleanup_interval();
        let high_water = config.pressure_high_water;

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut consolidate = interval_at(start + consolidate_every, consolidate_every);
            let mut cleanup = interval_at(start + cleanup_every, cleanup_every);
            consolidate.set_missed_tick_behavior(MissedTickBehavior::Delay);
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = consolidate_every.as_secs(),
                cleanup_secs = cleanup_every.as_secs(),
                "consolidation scheduler started"
            );

            loop {
                tokio::select! {
                    // Err means the scheduler handle was dropped
                    _ = shutdown_rx.changed() => break,
                    _ = consolidate.tick() => {
                        engine.tick().await;
                    }
                    _ = cleanup.tick() => {
                        let working = &engine.tiers().working;
                        let purged = working.cleanup_expired();
                        let pressure = working.get_memory_pressure();
                        debug!(purged, pressure, "working memory sweep");
                        if pressure > high_water {
                            info!(pressure, high_water, "memory pressure high, consolidating early");
                            engine.tick().await;
                        }
                    }
                }
            }

            info!("consolidation scheduler stopped");
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the task to stop and wait for it. A pass already in progress
    /// finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "consolidation scheduler task failed");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::MemoryConfig;
    use crate::memory::HashingEmbedder;
    use pretty_assertions::assert_eq;

    fn setup(ttl_seconds: u64) -> (Arc<ConsolidationEngine>, ManualClock) {
        setup_with(MemoryConfig::default().with_ttl_seconds(ttl_seconds))
    }

    fn setup_with(config: MemoryConfig) -> (Arc<ConsolidationEngine>, ManualClock) {
        let clock = ManualClock::starting_now();
        let tiers = Tiers::open(
            &config,
            Arc::new(clock.clone()),
            Arc::new(HashingEmbedder::new(64)),
        )
        .unwrap();
        let engine = ConsolidationEngine::new(
            Arc::new(tiers),
            RoutingTable::default(),
            &config.consolidation,
        );
        (Arc::new(engine), clock)
    }

    fn entry(id: &str, importance: f64, clock: &ManualClock) -> MemoryEntry {
        MemoryEntry::new_at(format!("note {}", id), clock.now())
            .with_id(id)
            .with_importance(importance)
    }

    #[tokio::test]
    async fn test_migrates_only_aged_entries() {
        let (engine, clock) = setup(90);
        let tiers = Arc::clone(engine.tiers());

        tiers.working.store(entry("old", 0.1, &clock));
        clock.advance_secs(11);
        tiers.working.store(entry("young", 0.1, &clock));
        clock.advance_secs(20);

        let report = engine.tick().await;
        assert_eq!(report.candidates, 1);
        assert_eq!(report.migrated, 1);
        assert_eq!(report.failed, 0);
        assert!(report.errors.is_empty());

        assert!(!tiers.working.contains(&EntryId::from("old")));
        assert!(tiers.working.contains(&EntryId::from("young")));
        let migrated = tiers.episodic.get_by_id(&EntryId::from("old")).unwrap().unwrap();
        assert_eq!(migrated.content, serde_json::json!("note old"));
    }

    #[tokio::test]
    async fn test_accessed_entries_are_promoted() {
        let (engine, clock) = setup(90);
        let tiers = Arc::clone(engine.tiers());

        tiers.working.store(entry("hot", 0.5, &clock));
        tiers.working.store(entry("critical", 0.85, &clock));
        tiers.working.store(entry("cold", 0.5, &clock));
        for _ in 0..3 {
            tiers.working.get_by_id(&EntryId::from("hot"));
        }
        tiers.working.get_by_id(&EntryId::from("critical"));
        clock.advance_secs(31);

        let report = engine.tick().await;
        assert_eq!(report.migrated, 3);
        assert_eq!(report.promoted, 2);

        // 0.5 + 3 * 0.05 routes to semantic
        let hot = tiers.semantic.get_by_id(&EntryId::from("hot")).unwrap();
        assert!((hot.importance - 0.65).abs() < 1e-9);
        assert!(tiers.episodic.get_by_id(&EntryId::from("hot")).unwrap().is_none());

        // 0.85 + 0.05 routes to persistent
        let critical = tiers
            .persistent
            .get_by_id(&EntryId::from("critical"))
            .unwrap()
            .unwrap();
        assert!((critical.importance - 0.9).abs() < 1e-9);

        assert!(tiers.episodic.get_by_id(&EntryId::from("cold")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_episodic_write_keeps_candidate() {
        let (engine, clock) = setup(90);
        let tiers = Arc::clone(engine.tiers());

        tiers.working.store(entry("stuck", 0.2, &clock));
        clock.advance_secs(45);
        tiers.episodic.close();

        let report = engine.tick().await;
        assert_eq!(report.candidates, 1);
        assert_eq!(report.migrated, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("stuck: "));
        assert!(tiers.working.contains(&EntryId::from("stuck")));
    }

    #[tokio::test]
    async fn test_failed_promotion_keeps_episodic_copy() {
        let (engine, clock) = setup(90);
        let tiers = Arc::clone(engine.tiers());

        tiers.working.store(entry("vital", 0.95, &clock));
        clock.advance_secs(31);
        tiers.persistent.close();

        let report = engine.tick().await;
        assert_eq!(report.migrated, 1);
        assert_eq!(report.promoted, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(tiers.episodic.get_by_id(&EntryId::from("vital")).unwrap().is_some());
    }

    /// Hold the episodic connection on a blocking thread for `duration`.
    async fn stall_episodic(tiers: &Arc<Tiers>, duration: Duration) -> JoinHandle<()> {
        let tiers = Arc::clone(tiers);
        let handle = tokio::task::spawn_blocking(move || tiers.episodic.stall(duration));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_episodic_write_keeps_candidate() {
        let (engine, clock) =
            setup_with(MemoryConfig::default().with_ttl_seconds(90).with_tier_timeout_ms(50));
        let tiers = Arc::clone(engine.tiers());

        tiers.working.store(entry("slow", 0.2, &clock));
        clock.advance_secs(31);
        let stall = stall_episodic(&tiers, Duration::from_millis(400)).await;

        let report = engine.tick().await;
        assert_eq!(report.candidates, 1);
        assert_eq!(report.migrated, 0);
        assert_eq!(report.failed, 1);
        assert!(report.errors[0].contains("timed out after 50ms"));
        assert!(tiers.working.contains(&EntryId::from("slow")));

        stall.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restore_during_pass_keeps_newer_entry() {
        let (engine, clock) = setup(90);
        let tiers = Arc::clone(engine.tiers());
        let id = EntryId::from("k");

        tiers
            .working
            .store(MemoryEntry::new_at("v1", clock.now()).with_id("k").with_importance(0.1));
        clock.advance_secs(31);
        let stall = stall_episodic(&tiers, Duration::from_millis(400)).await;

        let pass = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.tick().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tiers
            .working
            .store(MemoryEntry::new_at("v2", clock.now()).with_id("k").with_importance(0.1)));

        let report = pass.await.unwrap();
        stall.await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.migrated, 0);
        assert_eq!(report.superseded, 1);

        let kept = tiers.working.get_by_id(&id).unwrap();
        assert_eq!(kept.content, serde_json::json!("v2"));
        let written = tiers.episodic.get_by_id(&id).unwrap().unwrap();
        assert_eq!(written.content, serde_json::json!("v1"));

        let stats = tiers.working.get_stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expired, 0);

        // The next pass carries the newer entry over
        clock.advance_secs(31);
        let report = engine.tick().await;
        assert_eq!(report.migrated, 1);
        assert!(!tiers.working.contains(&id));
        let written = tiers.episodic.get_by_id(&id).unwrap().unwrap();
        assert_eq!(written.content, serde_json::json!("v2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entries_never_vanish_during_a_pass() {
        let (engine, clock) = setup(90);
        let tiers = Arc::clone(engine.tiers());

        let ids: Vec<EntryId> = (0..40)
            .map(|i| {
                let importance = if i % 2 == 0 { 0.1 } else { 0.92 };
                let e = entry(&format!("e{}", i), importance, &clock);
                let id = e.id.clone();
                assert!(tiers.working.store(e));
                id
            })
            .collect();
        clock.advance_secs(31);

        let pass = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.tick().await }
        });

        // Read tiers in migration order so a move between reads is still seen
        let present = |id: &EntryId| {
            tiers.working.contains(id)
                || tiers.episodic.get_by_id(id).ok().flatten().is_some()
                || tiers.semantic.get_by_id(id).is_some()
                || tiers.persistent.get_by_id(id).ok().flatten().is_some()
        };

        loop {
            let finished = pass.is_finished();
            for id in &ids {
                assert!(present(id), "{} missing from every tier", id);
            }
            if finished {
                break;
            }
            tokio::task::yield_now().await;
        }

        let report = pass.await.unwrap();
        assert_eq!(report.migrated, 40);
        assert_eq!(report.promoted, 20);
        assert!(tiers.working.is_empty());
    }

    #[tokio::test]
    async fn test_scheduler_runs_and_stops() {
        let (engine, clock) = setup(90);
        let tiers = Arc::clone(engine.tiers());
        tiers.working.store(entry("bg", 0.1, &clock));
        clock.advance_secs(31);

        let config = ConsolidationConfig {
            interval_seconds: 1,
            cleanup_interval_seconds: 1,
            ..Default::default()
        };
        let scheduler = ConsolidationScheduler::spawn(Arc::clone(&engine), &config);
        assert!(scheduler.is_running());

        let moved = tokio::time::timeout(Duration::from_secs(10), async {
            while tiers.working.contains(&EntryId::from("bg")) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(moved.is_ok(), "scheduler never consolidated");

        scheduler.shutdown().await;
        assert!(tiers.episodic.get_by_id(&EntryId::from("bg")).unwrap().is_some());
    }
}
