//! The dbuf cache: hold resolution, release and destruction.
//!
//! [`DbufCache`] is the public face; everything a buffer operation needs
//! lives in [`CacheShared`], which holds and I/O callbacks keep alive
//! through an `Arc`.
//!
//! Lock order, outermost first: dnode bonus slot → identity bucket → arena
//! → buffer → (tier sublist | dirty-record body | dnode state). A parent's
//! `bp_lock` is taken before the parent's buffer lock.
//!
//! # Logging
//!
//! - **INFO**  `dbc::cache` `dbuf_cache_init`: cache constructed
//! - **INFO**  `dbc::cache` `dbuf_cache_shutdown`: eviction worker stopped
//! - **TRACE** `dbc::cache` `dbuf_create`, `dbuf_destroy`: buffer lifecycle
//! - **DEBUG** `dbc::cache` `dbuf_create_race`: lost an insert race
//! - **DEBUG** `dbc::cache` `evict_dnode_dbufs`: object buffers dropped

use crate::arena::Arena;
use crate::config::{DbufCacheConfig, Tunables};
use crate::dbuf::{Dbuf, DbufHold, DbufInner, DbufState};
use crate::dirty::DirtyRecord;
use crate::dnode::{CachePolicy, Dnode};
use crate::evict::{CacheTier, EvictMsg, EvictWorker, TierList};
use crate::hash::IdentityTable;
use crate::stats::{DbufStats, DbufStatsSnapshot, bump};
use crate::txg::TxgWriteTracker;
use dbc_block::{BlockBuf, BlockStore, IoPriority, ReadFlags};
use dbc_error::{DbcError, Result};
use dbc_types::{BlkId, BlockPointer, BufIdentity, Txg};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::mpsc;
use tracing::{debug, info, trace};

pub(crate) struct CacheShared {
    pub tunables: Tunables,
    pub store: Arc<dyn BlockStore>,
    pub arena: Arena<Dbuf>,
    pub hash: IdentityTable,
    pub metadata_tier: TierList,
    pub general_tier: TierList,
    pub tier_seq: AtomicU64,
    pub stats: DbufStats,
    pub txgs: TxgWriteTracker,
    pub dirty_dnodes: Mutex<BTreeMap<Txg, Vec<Arc<Dnode>>>>,
    pub evict_tx: Option<mpsc::Sender<EvictMsg>>,
    pub wake_pending: AtomicBool,
}

/// A cache of in-memory copies of object blocks, with per-txg dirty
/// tracking and write-back.
pub struct DbufCache {
    shared: Arc<CacheShared>,
    worker: Mutex<Option<EvictWorker>>,
}

impl std::fmt::Debug for DbufCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbufCache")
            .field("buffers", &self.shared.arena.len())
            .field("general_tier_bytes", &self.shared.general_tier.bytes())
            .finish_non_exhaustive()
    }
}

impl DbufCache {
    /// Build a cache over `store`, starting the eviction worker if
    /// configured.
    pub fn new(config: DbufCacheConfig, store: Arc<dyn BlockStore>) -> Result<Self> {
        let (evict_tx, evict_rx) = if config.spawn_evict_worker {
            let (tx, rx) = mpsc::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let store_bytes = store.cache_size_bytes();
        info!(
            target: "dbc::cache",
            general_target = config.general_target(store_bytes),
            metadata_target = config.metadata_target(store_bytes),
            buckets = 1_u64 << config.hash_table_shift.min(24),
            sublists = config.cache_sublists,
            "dbuf_cache_init"
        );
        let shared = Arc::new(CacheShared {
            arena: Arena::new(),
            hash: IdentityTable::new(config.hash_table_shift),
            metadata_tier: TierList::new(config.cache_sublists),
            general_tier: TierList::new(config.cache_sublists),
            tier_seq: AtomicU64::new(0),
            stats: DbufStats::default(),
            txgs: TxgWriteTracker::new(),
            dirty_dnodes: Mutex::new(BTreeMap::new()),
            evict_tx: evict_tx.clone(),
            wake_pending: AtomicBool::new(false),
            tunables: Tunables::new(config),
            store,
        });
        let worker = match (evict_tx, evict_rx) {
            (Some(tx), Some(rx)) => Some(EvictWorker::spawn(&shared, tx, rx)?),
            _ => None,
        };
        Ok(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    /// Publish new tunables; targets are recomputed on next use.
    pub fn update_config(&self, config: DbufCacheConfig) {
        self.shared.tunables.update(config);
    }

    #[must_use]
    pub fn config(&self) -> Arc<DbufCacheConfig> {
        self.shared.tunables.load()
    }

    #[must_use]
    pub fn stats(&self) -> DbufStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Live buffers, held or cached.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.shared.arena.len()
    }

    #[must_use]
    pub fn general_tier_bytes(&self) -> u64 {
        self.shared.general_tier.bytes()
    }

    #[must_use]
    pub fn metadata_tier_bytes(&self) -> u64 {
        self.shared.metadata_tier.bytes()
    }

    #[must_use]
    pub fn general_tier_count(&self) -> u64 {
        self.shared.general_tier.count()
    }

    /// Stop the eviction worker. Buffers stay usable.
    pub fn shutdown(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
            info!(target: "dbc::cache", "dbuf_cache_shutdown");
        }
    }

    // ── Holds ───────────────────────────────────────────────────────────

    /// Hold level-0 block `blkid` of `dnode`.
    pub fn hold(&self, dnode: &Arc<Dnode>, blkid: BlkId) -> Result<DbufHold> {
        self.shared.hold_impl(dnode, 0, blkid, false)
    }

    pub fn hold_level(&self, dnode: &Arc<Dnode>, level: u8, blkid: BlkId) -> Result<DbufHold> {
        self.shared.hold_impl(dnode, level, blkid, false)
    }

    /// Hold, failing with [`DbcError::Hole`] if the block is unallocated.
    pub fn hold_sparse(&self, dnode: &Arc<Dnode>, level: u8, blkid: BlkId) -> Result<DbufHold> {
        self.shared.hold_impl(dnode, level, blkid, true)
    }

    #[must_use]
    pub fn hold_bonus(&self, dnode: &Arc<Dnode>) -> DbufHold {
        self.shared.hold_bonus(dnode)
    }

    pub fn hold_spill(&self, dnode: &Arc<Dnode>) -> Result<DbufHold> {
        self.shared.hold_impl(dnode, 0, BlkId::SPILL, false)
    }

    /// Hold an already-cached buffer without creating one.
    #[must_use]
    pub fn find(&self, id: &BufIdentity) -> Option<DbufHold> {
        let shared = &self.shared;
        shared
            .hash
            .find_map(&shared.arena, id, &shared.stats, |db, inner| {
                shared.add_hold_locked(db, inner);
                Arc::clone(db)
            })
            .map(|db| DbufHold::new(Arc::clone(shared), db))
    }

    /// Whether a live buffer exists for `id`.
    #[must_use]
    pub fn contains(&self, id: &BufIdentity) -> bool {
        self.shared.hash.contains(&self.shared.arena, id)
    }

    // ── Modification ────────────────────────────────────────────────────

    /// Drop the `txg` dirty record of a level-0 buffer. Returns true if
    /// the buffer was destroyed as a result.
    pub fn undirty(&self, id: &BufIdentity, txg: Txg) -> bool {
        let shared = &self.shared;
        let Some(db) = shared
            .hash
            .find_map(&shared.arena, id, &shared.stats, |db, _| Arc::clone(db))
        else {
            return false;
        };
        shared.undirty(&db, txg)
    }

    /// Drop the spill block of `dnode` in `txg`.
    pub fn rm_spill(&self, dnode: &Arc<Dnode>, txg: Txg) {
        self.shared.rm_spill(dnode, txg);
    }

    /// Free level-0 blocks `start..=end` of `dnode` in `txg`.
    pub fn free_range(&self, dnode: &Arc<Dnode>, start: BlkId, end: BlkId, txg: Txg) {
        self.shared.free_range(dnode, start.0, end.0, txg);
    }

    /// Dirty a level-0 block with `data` without creating a buffer for it.
    pub fn dirty_lightweight_leaf(
        &self,
        dnode: &Arc<Dnode>,
        blkid: BlkId,
        data: BlockBuf,
        txg: Txg,
    ) -> Result<Arc<DirtyRecord>> {
        self.shared.dirty_lightweight_leaf(dnode, blkid, data, txg)
    }

    // ── Sync ────────────────────────────────────────────────────────────

    /// Write out `records`, all at tree `level`, for `txg`.
    pub fn sync_list(&self, records: Vec<Arc<DirtyRecord>>, level: u8, txg: Txg) {
        self.shared.sync_list(records, level, txg, None);
    }

    /// Write out every dirty block of `dnode` for `txg`.
    pub fn sync_dnode(&self, dnode: &Arc<Dnode>, txg: Txg) {
        self.shared.sync_dnode(dnode, txg);
    }

    /// Write out every object dirtied in `txg`.
    pub fn sync_txg(&self, txg: Txg) {
        let dnodes = self.shared.dirty_dnodes.lock().remove(&txg).unwrap_or_default();
        for dnode in &dnodes {
            self.shared.sync_dnode(dnode, txg);
        }
    }

    /// Block until every write issued for `txg` has completed; returns the
    /// first write error recorded against it.
    pub fn wait_txg_synced(&self, txg: Txg) -> Result<()> {
        self.shared.txgs.wait_synced(txg)
    }

    /// Bytes dirtied in `txg` that have not yet been written.
    #[must_use]
    pub fn dirty_bytes(&self, txg: Txg) -> u64 {
        self.shared.txgs.dirty_bytes(txg)
    }

    // ── Prefetch and eviction ───────────────────────────────────────────

    /// Start asynchronous reads that bring block `blkid` at `level` into
    /// the cache. Returns false if nothing was issued.
    pub fn prefetch(&self, dnode: &Arc<Dnode>, level: u8, blkid: BlkId, priority: IoPriority) -> bool {
        self.shared.prefetch(dnode, level, blkid, priority)
    }

    /// Destroy every unheld buffer of `dnode`; held ones are destroyed on
    /// their last release.
    pub fn evict_dnode_dbufs(&self, dnode: &Arc<Dnode>) {
        self.shared.evict_dnode_dbufs(dnode);
    }

    /// Run one eviction cycle on the calling thread. Returns how many
    /// buffers were evicted.
    pub fn evict_to_lowater(&self) -> u64 {
        self.shared.evict_to_lowater()
    }
}

impl Drop for DbufCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CacheShared {
    /// Count a new hold; the first hold pulls the buffer out of its tier.
    pub(crate) fn add_hold_locked(&self, db: &Dbuf, inner: &mut DbufInner) {
        inner.holds += 1;
        if inner.holds == 1 && inner.tier != CacheTier::None {
            self.tier_remove(db, inner);
        }
    }

    pub(crate) fn hold_impl(
        self: &Arc<Self>,
        dnode: &Arc<Dnode>,
        level: u8,
        blkid: BlkId,
        fail_sparse: bool,
    ) -> Result<DbufHold> {
        if blkid == BlkId::BONUS {
            return Ok(self.hold_bonus(dnode));
        }
        if blkid.is_special() && level != 0 {
            return Err(DbcError::Format(format!("{blkid} exists only at level 0")));
        }
        if !blkid.is_special() && blkid.0 >= dnode.capacity(level) {
            return Err(DbcError::NoSpace);
        }

        let id = BufIdentity::new(dnode.objset(), dnode.object(), level, blkid);
        if let Some(db) = self.hash.find_map(&self.arena, &id, &self.stats, |db, inner| {
            self.add_hold_locked(db, inner);
            Arc::clone(db)
        }) {
            return Ok(DbufHold::new(Arc::clone(self), db));
        }

        let (parent, bp) = self.find_bp(dnode, level, blkid, fail_sparse)?;
        if fail_sparse && bp.is_none_or(|bp| bp.is_hole()) {
            return Err(DbcError::Hole);
        }
        Ok(self.create(dnode, level, blkid, parent, bp))
    }

    /// Resolve the parent buffer and block pointer of a block.
    fn find_bp(
        self: &Arc<Self>,
        dnode: &Arc<Dnode>,
        level: u8,
        blkid: BlkId,
        fail_sparse: bool,
    ) -> Result<(Option<DbufHold>, Option<BlockPointer>)> {
        if blkid == BlkId::SPILL {
            return Ok((None, Some(dnode.spill_blkptr())));
        }
        let epbs = dnode.epbs();
        let (nlevels, maxblkid) = {
            let phys = dnode.phys.read();
            (phys.nlevels, phys.maxblkid)
        };
        let level_max = maxblkid.checked_shr(u32::from(level) * epbs).unwrap_or(0);
        if level >= nlevels || blkid.0 > level_max {
            return Ok((None, None));
        }
        if level + 1 < nlevels {
            let parent = self.hold_impl(dnode, level + 1, BlkId(blkid.0 >> epbs), fail_sparse)?;
            self.read(parent.dbuf(), ReadFlags::NO_PREFETCH)?;
            let bp = self.child_blkptr(parent.dbuf(), dnode.child_slot(blkid.0))?;
            return Ok((Some(parent), Some(bp)));
        }
        let index = usize::try_from(blkid.0).map_err(|_| DbcError::NoSpace)?;
        Ok((None, dnode.root_blkptr(index)))
    }

    /// Create and insert a buffer, or hold the one a racing thread inserted.
    pub(crate) fn create(
        self: &Arc<Self>,
        dnode: &Arc<Dnode>,
        level: u8,
        blkid: BlkId,
        parent: Option<DbufHold>,
        bp: Option<BlockPointer>,
    ) -> DbufHold {
        let id = BufIdentity::new(dnode.objset(), dnode.object(), level, blkid);
        let parent_index = parent.as_ref().map(|p| p.dbuf().index);
        let db = self
            .arena
            .insert_with(|index| Dbuf::new(id, index, Arc::clone(dnode), bp, parent_index));

        let existing = self.hash.insert_if_absent(&self.arena, &db, &self.stats, |found, inner| {
            self.add_hold_locked(found, inner);
            Arc::clone(found)
        });
        if let Some(found) = existing {
            self.arena.remove(db.index);
            bump(&self.stats.hash_insert_races);
            debug!(target: "dbc::cache", %id, "dbuf_create_race");
            return DbufHold::new(Arc::clone(self), found);
        }

        // The new buffer keeps the parent hold for its lifetime.
        if let Some(parent) = parent {
            let _ = parent.transfer();
        }
        dnode.register_dbuf(level, blkid, db.index);
        trace!(target: "dbc::cache", %id, size = db.size(), "dbuf_create");
        DbufHold::new(Arc::clone(self), db)
    }

    pub(crate) fn hold_bonus(self: &Arc<Self>, dnode: &Arc<Dnode>) -> DbufHold {
        let mut slot = dnode.bonus_dbuf.lock();
        if let Some(db) = slot.as_ref() {
            let mut inner = db.inner.lock();
            if inner.state != DbufState::Evicting {
                inner.holds += 1;
                inner.pending_evict = false;
                return DbufHold::new(Arc::clone(self), Arc::clone(db));
            }
        }
        let id = BufIdentity::new(dnode.objset(), dnode.object(), 0, BlkId::BONUS);
        let db = self
            .arena
            .insert_with(|index| Dbuf::new(id, index, Arc::clone(dnode), None, None));
        *slot = Some(Arc::clone(&db));
        trace!(target: "dbc::cache", %id, size = db.size(), "dbuf_create");
        DbufHold::new(Arc::clone(self), db)
    }

    fn cacheable(db: &Dbuf) -> bool {
        match db.dnode.cache_policy() {
            CachePolicy::All => true,
            CachePolicy::Metadata => db.id.level > 0 || db.dnode.object_type().is_metadata(),
            CachePolicy::None => false,
        }
    }

    /// Release one hold.
    pub(crate) fn rele(&self, db: &Arc<Dbuf>) {
        let mut inner = db.inner.lock();
        assert!(inner.holds > 0, "release of unheld buffer {}", db.id);
        inner.holds -= 1;
        let evicted = if inner.immediate_evict && inner.holds == inner.dirty_count() {
            inner.user.take()
        } else {
            None
        };
        self.settle_release(db, inner);
        if let Some(user) = evicted {
            user.evict();
        }
    }

    fn settle_release(&self, db: &Arc<Dbuf>, inner: MutexGuard<'_, DbufInner>) {
        if inner.holds > 0 {
            return;
        }

        if db.id.is_bonus() {
            // The bonus buffer lives as long as its object.
            if inner.pending_evict {
                self.destroy(db, inner);
            }
            return;
        }

        match inner.state {
            DbufState::Uncached | DbufState::NoFill => self.destroy(db, inner),
            DbufState::Cached => {
                if inner.pending_evict || !Self::cacheable(db) {
                    self.destroy(db, inner);
                } else {
                    self.cache_insert(db, inner);
                }
            }
            state => panic!("last hold on {} released in state {state:?}", db.id),
        }
    }

    /// Tear down an unheld, clean buffer and release its parent.
    pub(crate) fn destroy(&self, db: &Arc<Dbuf>, mut inner: MutexGuard<'_, DbufInner>) {
        assert_eq!(inner.holds, 0, "destroying held buffer {}", db.id);
        assert!(inner.dirty.is_empty(), "destroying dirty buffer {}", db.id);
        assert_eq!(inner.tier, CacheTier::None, "destroying cached buffer {}", db.id);
        inner.state = DbufState::Evicting;
        db.mark_evicting();
        inner.data = None;
        let parent = inner.parent.take();
        let user = inner.user.take();
        drop(inner);
        if let Some(user) = user {
            user.evict();
        }

        if db.id.is_bonus() {
            let mut slot = db.dnode.bonus_dbuf.lock();
            if slot.as_ref().is_some_and(|b| Arc::ptr_eq(b, db)) {
                *slot = None;
            }
        } else {
            self.hash.remove(db, &self.stats);
            db.dnode.forget_dbuf(db.id.level, db.id.blkid, db.index);
        }
        self.arena.remove(db.index);
        bump(&self.stats.destroyed);
        trace!(target: "dbc::cache", id = %db.id, "dbuf_destroy");

        if let Some(parent) = parent.and_then(|idx| self.arena.get(idx)) {
            self.rele(&parent);
        }
    }

    pub(crate) fn note_dirty_dnode(&self, dnode: &Arc<Dnode>, txg: Txg) {
        if dnode.note_dirty(txg) {
            self.dirty_dnodes
                .lock()
                .entry(txg)
                .or_default()
                .push(Arc::clone(dnode));
        }
    }

    pub(crate) fn evict_dnode_dbufs(&self, dnode: &Arc<Dnode>) {
        let indexes = dnode.all_dbufs();
        let buffers: Vec<Arc<Dbuf>> = indexes.iter().filter_map(|i| self.arena.get(*i)).collect();
        for db in &buffers {
            db.inner.lock().pending_evict = true;
        }
        let mut destroyed = 0_u64;
        for db in &buffers {
            let mut inner = db.inner.lock();
            if inner.holds == 0 && inner.state != DbufState::Evicting {
                self.tier_remove(db, &mut inner);
                self.destroy(db, inner);
                destroyed += 1;
            }
        }

        let bonus = dnode.bonus_dbuf.lock().clone();
        if let Some(db) = bonus {
            let mut inner = db.inner.lock();
            if inner.holds == 0 && inner.state != DbufState::Evicting {
                self.destroy(&db, inner);
                destroyed += 1;
            } else {
                inner.pending_evict = true;
            }
        }
        debug!(
            target: "dbc::cache",
            objset = dnode.objset().0,
            object = dnode.object().0,
            destroyed,
            remaining = dnode.cached_buffer_count(),
            "evict_dnode_dbufs"
        );
    }
}
