//! Property-based tests for tier invariants using proptest.
//!
//! - Working memory never holds more bytes than its capacity
//! - Nothing past its TTL is ever returned from working memory
//! - Routing is monotonic in importance and always lands on a tier

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use proptest::prelude::*;
    use std::sync::Arc;

    use crate::clock::{Clock, ManualClock};
    use crate::memory::types::{EntryId, Stage};
    use crate::memory::working::tests::sized_entry;
    use crate::memory::working::{EvictionPolicy, WorkingMemory};
    use crate::routing::RoutingTable;

    const CAPACITY: usize = 1_000;

    fn policy() -> impl Strategy<Value = EvictionPolicy> {
        prop_oneof![
            Just(EvictionPolicy::Lru),
            Just(EvictionPolicy::Lfu),
            Just(EvictionPolicy::Fifo),
        ]
    }

    // (id suffix, size in bytes, touch an existing id first?)
    fn operations() -> impl Strategy<Value = Vec<(u8, usize, bool)>> {
        prop::collection::vec((0u8..20, 8usize..400, any::<bool>()), 1..60)
    }

    fn importance_with_edges() -> impl Strategy<Value = f64> {
        prop_oneof![
            Just(0.0),
            Just(0.3),
            Just(0.6),
            Just(0.9),
            Just(1.0),
            -1.0f64..2.0f64,
        ]
    }

    proptest! {
        /// Total bytes stay within capacity after every store.
        #[test]
        fn working_memory_never_exceeds_capacity(
            policy in policy(),
            ops in operations()
        ) {
            let clock = ManualClock::starting_now();
            let memory = WorkingMemory::new(
                CAPACITY,
                Duration::hours(1),
                policy,
                Arc::new(clock.clone()),
            );

            for (suffix, size, touch) in ops {
                let id = format!("e{}", suffix);
                if touch {
                    memory.get_by_id(&EntryId::from(id.as_str()));
                }
                clock.advance_secs(1);
                let stored = memory.store(sized_entry(&id, size, clock.now()));
                prop_assert!(stored, "entry of {} bytes should fit", size);

                let stats = memory.get_stats();
                prop_assert!(
                    stats.total_size_bytes <= CAPACITY,
                    "{} bytes held with capacity {}", stats.total_size_bytes, CAPACITY
                );
                prop_assert!(memory.contains(&EntryId::from(id.as_str())));
            }
        }

        /// Entries older than the TTL are never returned.
        #[test]
        fn expired_entries_are_never_returned(
            ttl_secs in 1i64..600,
            ages in prop::collection::vec(0i64..1200, 1..20)
        ) {
            let clock = ManualClock::starting_now();
            let start = clock.now();
            let memory = WorkingMemory::new(
                1 << 20,
                Duration::seconds(ttl_secs),
                EvictionPolicy::Lru,
                Arc::new(clock.clone()),
            );

            for (i, age) in ages.iter().enumerate() {
                let entry = sized_entry(&format!("t{}", i), 32, start - Duration::seconds(*age));
                memory.store(entry);
            }

            for (i, age) in ages.iter().enumerate() {
                let found = memory.get_by_id(&EntryId::from(format!("t{}", i)));
                prop_assert_eq!(found.is_some(), *age <= ttl_secs);
            }
            for hit in memory.search("x", 100) {
                prop_assert!(hit.entry.age(clock.now()) <= Duration::seconds(ttl_secs));
            }
        }

        /// Higher importance never routes to a lower tier.
        #[test]
        fn routing_is_monotonic(
            a in importance_with_edges(),
            b in importance_with_edges()
        ) {
            let table = RoutingTable::default();
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(table.route(low) <= table.route(high));
        }

        /// Every importance, including out-of-range input, maps to a tier.
        #[test]
        fn routing_covers_every_importance(importance in importance_with_edges()) {
            let stage = RoutingTable::default().route(importance);
            prop_assert!(Stage::ALL.contains(&stage));
        }
    }
}
