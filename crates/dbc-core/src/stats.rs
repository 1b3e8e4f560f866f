//! Point-in-time diagnostics counters.
//!
//! Counters are relaxed atomics; a snapshot is not a consistent cut across
//! fields, only a read of each one. Reading them never changes cache
//! behaviour.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-level occupancy is tracked for levels `0..MAX_TRACKED_LEVELS`;
/// deeper levels fold into the last slot.
pub const MAX_TRACKED_LEVELS: usize = 8;

#[derive(Debug, Default)]
pub(crate) struct DbufStats {
    pub hash_hits: AtomicU64,
    pub hash_misses: AtomicU64,
    pub hash_collisions: AtomicU64,
    pub hash_elements: AtomicU64,
    pub hash_chain_max: AtomicU64,
    pub hash_insert_races: AtomicU64,

    pub metadata_cache_count: AtomicU64,
    pub metadata_cache_bytes: AtomicU64,
    pub metadata_cache_overflow: AtomicU64,
    pub cache_count: AtomicU64,
    pub cache_bytes: AtomicU64,
    pub cache_level_count: [AtomicU64; MAX_TRACKED_LEVELS],
    pub cache_level_bytes: [AtomicU64; MAX_TRACKED_LEVELS],

    pub evictions: AtomicU64,
    pub direct_evictions: AtomicU64,
    pub destroyed: AtomicU64,

    pub cow_copies: AtomicU64,
    pub hole_fills: AtomicU64,
    pub reads: AtomicU64,
    pub read_errors: AtomicU64,
    pub prefetches: AtomicU64,
    pub writes: AtomicU64,
    pub write_errors: AtomicU64,
    pub overrides_adopted: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn level_slot(level: u8) -> usize {
    usize::from(level).min(MAX_TRACKED_LEVELS - 1)
}

impl DbufStats {
    pub fn note_chain_len(&self, len: u64) {
        self.hash_chain_max.fetch_max(len, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DbufStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DbufStatsSnapshot {
            hash_hits: load(&self.hash_hits),
            hash_misses: load(&self.hash_misses),
            hash_collisions: load(&self.hash_collisions),
            hash_elements: load(&self.hash_elements),
            hash_chain_max: load(&self.hash_chain_max),
            hash_insert_races: load(&self.hash_insert_races),
            metadata_cache_count: load(&self.metadata_cache_count),
            metadata_cache_bytes: load(&self.metadata_cache_bytes),
            metadata_cache_overflow: load(&self.metadata_cache_overflow),
            cache_count: load(&self.cache_count),
            cache_bytes: load(&self.cache_bytes),
            cache_level_count: self.cache_level_count.each_ref().map(load),
            cache_level_bytes: self.cache_level_bytes.each_ref().map(load),
            evictions: load(&self.evictions),
            direct_evictions: load(&self.direct_evictions),
            destroyed: load(&self.destroyed),
            cow_copies: load(&self.cow_copies),
            hole_fills: load(&self.hole_fills),
            reads: load(&self.reads),
            read_errors: load(&self.read_errors),
            prefetches: load(&self.prefetches),
            writes: load(&self.writes),
            write_errors: load(&self.write_errors),
            overrides_adopted: load(&self.overrides_adopted),
        }
    }
}

/// Immutable snapshot of cache counters for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbufStatsSnapshot {
    pub hash_hits: u64,
    pub hash_misses: u64,
    /// Inserts into a non-empty bucket.
    pub hash_collisions: u64,
    pub hash_elements: u64,
    pub hash_chain_max: u64,
    /// Creations that lost to a concurrent insert of the same identity.
    pub hash_insert_races: u64,

    pub metadata_cache_count: u64,
    pub metadata_cache_bytes: u64,
    /// Metadata-eligible buffers sent to the general tier because the
    /// metadata tier was full.
    pub metadata_cache_overflow: u64,
    pub cache_count: u64,
    pub cache_bytes: u64,
    pub cache_level_count: [u64; MAX_TRACKED_LEVELS],
    pub cache_level_bytes: [u64; MAX_TRACKED_LEVELS],

    /// Evictions performed by the background worker.
    pub evictions: u64,
    /// Evictions performed by inserting threads above the high watermark.
    pub direct_evictions: u64,
    pub destroyed: u64,

    pub cow_copies: u64,
    pub hole_fills: u64,
    pub reads: u64,
    pub read_errors: u64,
    pub prefetches: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub overrides_adopted: u64,
}

impl DbufStatsSnapshot {
    /// Hash hit rate as a fraction [0.0, 1.0].
    #[must_use]
    #[expect(clippy::cast_precision_loss)] // counters stay far below 2^52
    pub fn hit_rate(&self) -> f64 {
        let total = self.hash_hits + self.hash_misses;
        if total == 0 {
            return 0.0;
        }
        self.hash_hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_each_counter() {
        let stats = DbufStats::default();
        bump(&stats.hash_hits);
        bump(&stats.hash_hits);
        bump(&stats.hash_misses);
        stats.cache_level_bytes[level_slot(2)].fetch_add(4096, Ordering::Relaxed);
        stats.note_chain_len(3);
        stats.note_chain_len(2);

        let snap = stats.snapshot();
        assert_eq!(snap.hash_hits, 2);
        assert_eq!(snap.hash_chain_max, 3);
        assert_eq!(snap.cache_level_bytes[2], 4096);
        assert!((snap.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deep_levels_fold_into_last_slot() {
        assert_eq!(level_slot(0), 0);
        assert_eq!(level_slot(200), MAX_TRACKED_LEVELS - 1);
    }

    #[test]
    fn snapshot_serializes() {
        let snap = DbufStats::default().snapshot();
        let json = serde_json::to_value(&snap).expect("serialize");
        assert_eq!(json["cache_bytes"], 0);
        assert!((snap.hit_rate()).abs() < f64::EPSILON);
    }
}
