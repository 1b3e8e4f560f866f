//! Cache tiers and the background eviction worker.
//!
//! Unheld buffers wait in one of two tiers, each split into sublists keyed
//! by insertion sequence so the oldest entries come first. The general tier
//! is kept near its target size: an inserting thread above the high
//! watermark evicts one buffer itself and wakes the worker, which then
//! evicts until the tier is under the low watermark. The metadata tier is
//! only drained when its object's buffers are evicted.
//!
//! Lock order: buffer → sublist. The evictor holds a sublist lock and only
//! try-locks buffers, skipping any it cannot take.
//!
//! # Logging
//!
//! - **TRACE** `dbc::evict` `evict_victim`: one buffer chosen for eviction
//! - **DEBUG** `dbc::evict` `evict_cycle`: worker finished a cycle
//! - **DEBUG** `dbc::evict` `evict_worker_exit`: worker thread stopped
//! - **WARN**  `dbc::evict` `evict_no_victim`: tier above target with no evictable entry

use crate::cache::CacheShared;
use crate::dbuf::{Dbuf, DbufInner};
use crate::hash::identity_hash;
use crate::stats::{bump, level_slot};
use dbc_error::Result;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Oldest entries examined per sublist when picking a victim.
const EVICT_SCAN: usize = 8;

/// Which cache tier an unheld buffer sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTier {
    /// Held, or not cached.
    None,
    Metadata,
    General,
}

pub(crate) struct TierList {
    sublists: Box<[Mutex<BTreeMap<u64, Arc<Dbuf>>>]>,
    bytes: AtomicU64,
    count: AtomicU64,
    cursor: AtomicUsize,
}

impl TierList {
    pub fn new(sublists: usize) -> Self {
        let n = sublists.max(1);
        Self {
            sublists: (0..n).map(|_| Mutex::new(BTreeMap::new())).collect(),
            bytes: AtomicU64::new(0),
            count: AtomicU64::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn sublist_for(&self, db: &Dbuf) -> &Mutex<BTreeMap<u64, Arc<Dbuf>>> {
        let n = u64::try_from(self.sublists.len()).unwrap_or(1);
        let slot = usize::try_from(identity_hash(&db.id) % n).unwrap_or(0);
        &self.sublists[slot]
    }

    fn insert(&self, db: &Arc<Dbuf>, seq: u64) {
        let mut list = self.sublist_for(db).lock();
        list.insert(seq, Arc::clone(db));
        self.bytes.fetch_add(size_u64(db), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn remove(&self, db: &Dbuf, seq: u64) {
        let mut list = self.sublist_for(db).lock();
        if list.remove(&seq).is_some() {
            self.bytes.fetch_sub(size_u64(db), Ordering::Relaxed);
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

fn size_u64(db: &Dbuf) -> u64 {
    u64::try_from(db.size()).unwrap_or(u64::MAX)
}

pub(crate) enum EvictMsg {
    Wake,
    Shutdown,
}

pub(crate) struct EvictWorker {
    tx: mpsc::Sender<EvictMsg>,
    handle: Option<JoinHandle<()>>,
}

impl EvictWorker {
    pub fn spawn(
        shared: &Arc<CacheShared>,
        tx: mpsc::Sender<EvictMsg>,
        rx: mpsc::Receiver<EvictMsg>,
    ) -> Result<Self> {
        let weak = Arc::downgrade(shared);
        let handle = std::thread::Builder::new()
            .name("dbuf-evict".to_owned())
            .spawn(move || worker_loop(&weak, &rx))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        let _ = self.tx.send(EvictMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Weak<CacheShared>, rx: &mpsc::Receiver<EvictMsg>) {
    loop {
        // Sleeps until an inserter finds the general tier over target.
        match rx.recv() {
            Ok(EvictMsg::Wake) => {}
            Ok(EvictMsg::Shutdown) | Err(_) => break,
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.wake_pending.store(false, Ordering::Release);
        let evicted = shared.evict_to_lowater();
        if evicted > 0 {
            debug!(
                target: "dbc::evict",
                evicted,
                remaining_bytes = shared.general_tier.bytes(),
                "evict_cycle"
            );
        }
    }
    debug!(target: "dbc::evict", "evict_worker_exit");
}

impl CacheShared {
    fn tier_list(&self, tier: CacheTier) -> Option<&TierList> {
        match tier {
            CacheTier::None => None,
            CacheTier::Metadata => Some(&self.metadata_tier),
            CacheTier::General => Some(&self.general_tier),
        }
    }

    fn account_tier(&self, tier: CacheTier, db: &Dbuf, added: bool) {
        let size = size_u64(db);
        let apply = |counter: &AtomicU64, amount: u64| {
            if added {
                counter.fetch_add(amount, Ordering::Relaxed);
            } else {
                counter.fetch_sub(amount, Ordering::Relaxed);
            }
        };
        match tier {
            CacheTier::None => {}
            CacheTier::Metadata => {
                apply(&self.stats.metadata_cache_count, 1);
                apply(&self.stats.metadata_cache_bytes, size);
            }
            CacheTier::General => {
                let slot = level_slot(db.id.level);
                apply(&self.stats.cache_count, 1);
                apply(&self.stats.cache_bytes, size);
                apply(&self.stats.cache_level_count[slot], 1);
                apply(&self.stats.cache_level_bytes[slot], size);
            }
        }
    }

    /// Take an unheld buffer out of its tier. Caller holds the buffer lock.
    pub(crate) fn tier_remove(&self, db: &Dbuf, inner: &mut DbufInner) {
        let tier = inner.tier;
        let Some(list) = self.tier_list(tier) else {
            return;
        };
        list.remove(db, inner.tier_seq);
        inner.tier = CacheTier::None;
        self.account_tier(tier, db, false);
    }

    /// Park a buffer whose last hold was just released.
    pub(crate) fn cache_insert(&self, db: &Arc<Dbuf>, mut inner: MutexGuard<'_, DbufInner>) {
        let config = self.tunables.load();
        let store_bytes = self.store.cache_size_bytes();

        let mut tier = CacheTier::General;
        if db.dnode.object_type().is_metadata_cached() {
            let admitted = self.metadata_tier.bytes().saturating_add(size_u64(db));
            if admitted > config.metadata_target(store_bytes) {
                bump(&self.stats.metadata_cache_overflow);
            } else {
                tier = CacheTier::Metadata;
            }
        }

        let seq = self.tier_seq.fetch_add(1, Ordering::Relaxed);
        let Some(list) = self.tier_list(tier) else {
            return;
        };
        list.insert(db, seq);
        inner.tier = tier;
        inner.tier_seq = seq;
        self.account_tier(tier, db, true);
        drop(inner);

        if tier == CacheTier::General {
            let target = config.general_target(store_bytes);
            let size = self.general_tier.bytes();
            if size > target {
                if size > config.hiwater(target) && self.evict_one() {
                    bump(&self.stats.direct_evictions);
                }
                self.wake_evictor();
            }
        }
    }

    pub(crate) fn wake_evictor(&self) {
        let Some(tx) = &self.evict_tx else {
            return;
        };
        if !self.wake_pending.swap(true, Ordering::AcqRel) {
            let _ = tx.send(EvictMsg::Wake);
        }
    }

    /// Destroy the oldest lockable buffer of the general tier.
    pub(crate) fn evict_one(&self) -> bool {
        let sublists = &self.general_tier.sublists;
        let n = sublists.len();
        let start = self.general_tier.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let mut list = sublists[(start + offset) % n].lock();
            let candidates: Vec<(u64, Arc<Dbuf>)> = list
                .iter()
                .take(EVICT_SCAN)
                .map(|(seq, db)| (*seq, Arc::clone(db)))
                .collect();
            for (seq, db) in candidates {
                let Some(mut inner) = db.inner.try_lock() else {
                    continue;
                };
                assert_eq!(inner.holds, 0, "held buffer {} in cache tier", db.id);
                list.remove(&seq);
                self.general_tier.bytes.fetch_sub(size_u64(&db), Ordering::Relaxed);
                self.general_tier.count.fetch_sub(1, Ordering::Relaxed);
                inner.tier = CacheTier::None;
                self.account_tier(CacheTier::General, &db, false);
                drop(list);
                trace!(target: "dbc::evict", id = %db.id, size = db.size(), "evict_victim");
                self.destroy(&db, inner);
                return true;
            }
        }
        false
    }

    /// Evict until the general tier is under its low watermark.
    pub(crate) fn evict_to_lowater(&self) -> u64 {
        let config = self.tunables.load();
        let lowater = config.lowater(config.general_target(self.store.cache_size_bytes()));
        let mut evicted = 0;
        while self.general_tier.bytes() > lowater {
            if !self.evict_one() {
                warn!(
                    target: "dbc::evict",
                    bytes = self.general_tier.bytes(),
                    lowater,
                    "evict_no_victim"
                );
                break;
            }
            bump(&self.stats.evictions);
            evicted += 1;
        }
        evicted
    }
}
