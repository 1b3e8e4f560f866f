//! Identity table: the authoritative map from [`BufIdentity`] to live buffer.
//!
//! A fixed array of buckets, each a short chain behind its own mutex. Lookups
//! and inserts run caller closures while holding both the bucket lock and
//! the found buffer's lock, so "find and take a hold" is atomic with respect
//! to eviction. Entries whose buffer is already evicting are invisible.
//!
//! Lock order: bucket → arena → buffer. Never take a bucket lock while
//! holding a buffer lock.

use crate::arena::{Arena, DbufIndex};
use crate::dbuf::{Dbuf, DbufInner, DbufState};
use crate::stats::{DbufStats, bump};
use dbc_types::BufIdentity;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;

const MIN_SHIFT: u8 = 1;
const MAX_SHIFT: u8 = 24;

struct Entry {
    id: BufIdentity,
    index: DbufIndex,
}

pub(crate) struct IdentityTable {
    buckets: Box<[Mutex<Vec<Entry>>]>,
    mask: u64,
}

/// Bucket selector over the identity tuple.
pub(crate) fn identity_hash(id: &BufIdentity) -> u64 {
    let mut h = id.objset.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= id.object.0.rotate_left(23).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h ^= u64::from(id.level) << 56;
    h ^= id.blkid.0.wrapping_mul(0x1656_67B1_9E37_79F9);
    // splitmix64 finalizer
    h ^= h >> 30;
    h = h.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    h ^= h >> 27;
    h = h.wrapping_mul(0x94D0_49BB_1331_11EB);
    h ^ (h >> 31)
}

impl IdentityTable {
    pub fn new(shift: u8) -> Self {
        let shift = shift.clamp(MIN_SHIFT, MAX_SHIFT);
        let count = 1_usize << shift;
        let buckets = (0..count).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            buckets,
            mask: (1_u64 << shift) - 1,
        }
    }

    fn bucket(&self, id: &BufIdentity) -> &Mutex<Vec<Entry>> {
        // mask keeps the value below the bucket count, which fits usize
        let slot = usize::try_from(identity_hash(id) & self.mask).unwrap_or(0);
        &self.buckets[slot]
    }

    /// Find the live buffer for `id` and run `f` under its lock.
    pub fn find_map<R>(
        &self,
        arena: &Arena<Dbuf>,
        id: &BufIdentity,
        stats: &DbufStats,
        f: impl FnOnce(&Arc<Dbuf>, &mut DbufInner) -> R,
    ) -> Option<R> {
        let bucket = self.bucket(id).lock();
        for entry in bucket.iter().filter(|e| e.id == *id) {
            let Some(db) = arena.get(entry.index) else {
                continue;
            };
            if db.is_evicting() {
                continue;
            }
            let mut inner = db.inner.lock();
            if inner.state == DbufState::Evicting {
                continue;
            }
            bump(&stats.hash_hits);
            return Some(f(&db, &mut inner));
        }
        bump(&stats.hash_misses);
        None
    }

    /// Whether a live buffer exists for `id`, without touching hit counters.
    pub fn contains(&self, arena: &Arena<Dbuf>, id: &BufIdentity) -> bool {
        let bucket = self.bucket(id).lock();
        bucket
            .iter()
            .filter(|e| e.id == *id)
            .filter_map(|e| arena.get(e.index))
            .any(|db| !db.is_evicting())
    }

    /// Insert `candidate` unless a live buffer with its identity exists.
    ///
    /// Returns `None` when inserted. Otherwise runs `on_existing` under the
    /// existing buffer's lock and returns its result; the candidate is not
    /// inserted.
    pub fn insert_if_absent<R>(
        &self,
        arena: &Arena<Dbuf>,
        candidate: &Arc<Dbuf>,
        stats: &DbufStats,
        on_existing: impl FnOnce(&Arc<Dbuf>, &mut DbufInner) -> R,
    ) -> Option<R> {
        let mut bucket = self.bucket(&candidate.id).lock();
        for entry in bucket.iter().filter(|e| e.id == candidate.id) {
            let Some(db) = arena.get(entry.index) else {
                continue;
            };
            if db.is_evicting() {
                continue;
            }
            let mut inner = db.inner.lock();
            if inner.state == DbufState::Evicting {
                continue;
            }
            return Some(on_existing(&db, &mut inner));
        }
        if !bucket.is_empty() {
            bump(&stats.hash_collisions);
        }
        bucket.push(Entry {
            id: candidate.id,
            index: candidate.index,
        });
        bump(&stats.hash_elements);
        stats.note_chain_len(u64::try_from(bucket.len()).unwrap_or(u64::MAX));
        None
    }

    /// Unlink an evicting buffer. Panics if it is not present.
    pub fn remove(&self, db: &Dbuf, stats: &DbufStats) {
        let mut bucket = self.bucket(&db.id).lock();
        let Some(pos) = bucket.iter().position(|e| e.index == db.index) else {
            panic!("buffer {} missing from identity table", db.id);
        };
        {
            let inner = db.inner.lock();
            assert!(
                inner.state == DbufState::Evicting && inner.holds == 0,
                "removing live buffer {} (state {:?}, holds {})",
                db.id,
                inner.state,
                inner.holds
            );
        }
        bucket.swap_remove(pos);
        stats.hash_elements.fetch_sub(1, Ordering::Relaxed);
    }
}
