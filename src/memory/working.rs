//! Working memory: bounded in-process cache with TTL and eviction.
//!
//! All state lives behind a single lock and no I/O happens while it is held.
//! Capacity is tracked in approximate bytes (see
//! [`MemoryEntry::approx_size_bytes`]); `total_bytes <= capacity` holds after
//! every call.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::WorkingConfig;
use crate::error::Error;
use crate::memory::types::{
    EntryId, MemoryEntry, ScoredEntry, Stage, CONTENT_MATCH_SCORE, METADATA_MATCH_SCORE,
};

/// Which entry to drop when the cache is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently read or written
    #[default]
    Lru,
    /// Fewest accesses, oldest first on ties
    Lfu,
    /// Oldest timestamp regardless of access
    Fifo,
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
            EvictionPolicy::Lfu => write!(f, "lfu"),
            EvictionPolicy::Fifo => write!(f, "fifo"),
        }
    }
}

impl std::str::FromStr for EvictionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "fifo" => Ok(EvictionPolicy::Fifo),
            other => Err(Error::Config(format!("unknown eviction policy '{}'", other))),
        }
    }
}

/// Working memory statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingStats {
    pub entry_count: usize,
    pub total_size_bytes: usize,
    pub max_size_bytes: usize,
    /// `total_size_bytes / max_size_bytes`
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expired: u64,
    pub average_age_seconds: f64,
    pub oldest_age_seconds: f64,
    pub eviction_policy: EvictionPolicy,
}

struct Slot {
    entry: MemoryEntry,
    size: usize,
    /// Sequence number of the last read or write
    touched: u64,
    /// Sequence number of the insertion, final tie-break
    inserted: u64,
}

#[derive(Default)]
struct WorkingState {
    slots: HashMap<EntryId, Slot>,
    total_bytes: usize,
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

impl WorkingState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn take(&mut self, id: &EntryId) -> Option<Slot> {
        let slot = self.slots.remove(id)?;
        self.total_bytes -= slot.size;
        Some(slot)
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<EntryId> {
        let slots = self.slots.iter();
        let chosen = match policy {
            EvictionPolicy::Lru => slots.min_by_key(|(_, s)| s.touched),
            EvictionPolicy::Lfu => slots.min_by_key(|(_, s)| {
                (s.entry.access_count, s.entry.timestamp, s.inserted)
            }),
            EvictionPolicy::Fifo => slots.min_by_key(|(_, s)| (s.entry.timestamp, s.inserted)),
        };
        chosen.map(|(id, _)| id.clone())
    }
}

/// Bounded, TTL-limited, lowest-latency tier.
pub struct WorkingMemory {
    capacity: usize,
    ttl: Duration,
    policy: EvictionPolicy,
    clock: SharedClock,
    state: Mutex<WorkingState>,
}

impl WorkingMemory {
    /// Create a working memory holding at most `max_size_bytes`.
    pub fn new(
        max_size_bytes: usize,
        ttl: Duration,
        policy: EvictionPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            capacity: max_size_bytes,
            ttl,
            policy,
            clock,
            state: Mutex::new(WorkingState::default()),
        }
    }

    pub fn from_config(config: &WorkingConfig, clock: SharedClock) -> Self {
        Self::new(
            config.max_size_bytes(),
            config.ttl(),
            config.eviction_policy,
            clock,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn is_expired(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        entry.age(now) > self.ttl
    }

    fn purge_expired(&self, state: &mut WorkingState, now: DateTime<Utc>) -> usize {
        let expired: Vec<EntryId> = state
            .slots
            .iter()
            .filter(|(_, s)| self.is_expired(&s.entry, now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            state.take(id);
            state.expired += 1;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "purged expired working memory entries");
        }
        expired.len()
    }

    /// Insert an entry, evicting per policy until it fits.
    ///
    /// Returns `false` without side effects when the entry alone exceeds
    /// capacity.
    pub fn store(&self, mut entry: MemoryEntry) -> bool {
        let size = entry.approx_size_bytes();
        if size > self.capacity {
            debug!(
                id = %entry.id,
                size,
                capacity = self.capacity,
                "entry rejected: larger than working memory"
            );
            return false;
        }

        let now = self.clock.now();
        entry.stage = None;

        let mut state = self.state.lock();
        state.take(&entry.id);

        if state.total_bytes + size > self.capacity {
            self.purge_expired(&mut state, now);
        }
        while state.total_bytes + size > self.capacity {
            let Some(victim) = state.victim(self.policy) else {
                return false;
            };
            state.take(&victim);
            state.evictions += 1;
            debug!(id = %victim, policy = %self.policy, "evicted from working memory");
        }

        let seq = state.next_seq();
        state.total_bytes += size;
        state.slots.insert(
            entry.id.clone(),
            Slot {
                entry,
                size,
                touched: seq,
                inserted: seq,
            },
        );
        true
    }

    /// Fetch an entry, recording the access. Expired entries are purged and
    /// reported as not found.
    pub fn get_by_id(&self, id: &EntryId) -> Option<MemoryEntry> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let expired = match state.slots.get(id) {
            Some(slot) => self.is_expired(&slot.entry, now),
            None => {
                state.misses += 1;
                return None;
            }
        };
        if expired {
            state.take(id);
            state.expired += 1;
            state.misses += 1;
            return None;
        }

        let seq = state.next_seq();
        state.hits += 1;
        let slot = state.slots.get_mut(id)?;
        slot.entry.record_access(now);
        slot.touched = seq;
        Some(slot.entry.clone().with_stage(Stage::Working))
    }

    /// Substring search over content, then metadata if still short of
    /// `n_results`. Newest entries are returned first within each pass.
    pub fn search(&self, query: &str, n_results: usize) -> Vec<ScoredEntry> {
        if n_results == 0 {
            return Vec::new();
        }
        let needle = query.to_lowercase();
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.purge_expired(&mut state, now);

        let mut candidates: Vec<(&EntryId, &Slot)> = state.slots.iter().collect();
        candidates.sort_by(|a, b| {
            b.1.entry
                .timestamp
                .cmp(&a.1.entry.timestamp)
                .then(b.1.inserted.cmp(&a.1.inserted))
        });

        let mut hits: Vec<(EntryId, f64)> = candidates
            .iter()
            .filter(|(_, s)| s.entry.content_matches(&needle))
            .take(n_results)
            .map(|(id, _)| ((*id).clone(), CONTENT_MATCH_SCORE))
            .collect();

        if hits.len() < n_results {
            let remaining = n_results - hits.len();
            let metadata_hits: Vec<(EntryId, f64)> = candidates
                .iter()
                .filter(|(_, s)| {
                    !s.entry.content_matches(&needle) && s.entry.metadata_matches(&needle)
                })
                .take(remaining)
                .map(|(id, _)| ((*id).clone(), METADATA_MATCH_SCORE))
                .collect();
            hits.extend(metadata_hits);
        }

        let mut results = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            let seq = state.next_seq();
            if let Some(slot) = state.slots.get_mut(&id) {
                slot.entry.record_access(now);
                slot.touched = seq;
                results.push(ScoredEntry::new(
                    slot.entry.clone().with_stage(Stage::Working),
                    score,
                ));
            }
        }
        results
    }

    /// Non-expired entries older than `ttl / 3`, oldest first.
    pub fn get_all_for_consolidation(&self) -> Vec<MemoryEntry> {
        self.consolidation_snapshot()
            .into_iter()
            .map(|(entry, _)| entry)
            .collect()
    }

    /// Like [`get_all_for_consolidation`](Self::get_all_for_consolidation),
    /// paired with each slot's insertion sequence for
    /// [`remove_if_unchanged`](Self::remove_if_unchanged).
    pub(crate) fn consolidation_snapshot(&self) -> Vec<(MemoryEntry, u64)> {
        let now = self.clock.now();
        let min_age = self.ttl / 3;
        let mut state = self.state.lock();
        self.purge_expired(&mut state, now);

        let mut candidates: Vec<(MemoryEntry, u64)> = state
            .slots
            .values()
            .filter(|s| s.entry.age(now) > min_age)
            .map(|s| (s.entry.clone().with_stage(Stage::Working), s.inserted))
            .collect();
        candidates.sort_by(|a, b| a.0.timestamp.cmp(&b.0.timestamp).then(a.1.cmp(&b.1)));
        candidates
    }

    pub fn remove(&self, id: &EntryId) -> bool {
        self.state.lock().take(id).is_some()
    }

    /// Remove `id` only if its slot is still the one inserted at `inserted`.
    /// An entry stored again under the same id since then is kept.
    pub(crate) fn remove_if_unchanged(&self, id: &EntryId, inserted: u64) -> bool {
        let mut state = self.state.lock();
        match state.slots.get(id) {
            Some(slot) if slot.inserted == inserted => state.take(id).is_some(),
            _ => false,
        }
    }

    /// Purge every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.purge_expired(&mut state, now)
    }

    /// Whether a live (non-expired) entry with this id exists. Does not
    /// record an access.
    pub fn contains(&self, id: &EntryId) -> bool {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .slots
            .get(id)
            .map(|s| !self.is_expired(&s.entry, now))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes in use divided by capacity, in [0, 1].
    pub fn get_memory_pressure(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        let total = self.state.lock().total_bytes;
        (total as f64 / self.capacity as f64).clamp(0.0, 1.0)
    }

    pub fn get_stats(&self) -> WorkingStats {
        let now = self.clock.now();
        let state = self.state.lock();

        let ages: Vec<f64> = state
            .slots
            .values()
            .map(|s| s.entry.age(now).num_milliseconds() as f64 / 1000.0)
            .collect();
        let average_age_seconds = if ages.is_empty() {
            0.0
        } else {
            ages.iter().sum::<f64>() / ages.len() as f64
        };
        let oldest_age_seconds = ages.iter().cloned().fold(0.0, f64::max);

        let lookups = state.hits + state.misses;
        WorkingStats {
            entry_count: state.slots.len(),
            total_size_bytes: state.total_bytes,
            max_size_bytes: self.capacity,
            utilization: if self.capacity == 0 {
                0.0
            } else {
                state.total_bytes as f64 / self.capacity as f64
            },
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            evictions: state.evictions,
            expired: state.expired,
            average_age_seconds,
            oldest_age_seconds,
            eviction_policy: self.policy,
        }
    }
}
