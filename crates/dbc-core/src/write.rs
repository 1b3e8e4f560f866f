//! Modification: dirty records, fills, content hand-off, overrides and
//! range frees.
//!
//! Dirtying a block takes one extra hold per txg and dirties every
//! ancestor in the same txg, linking the child record under the parent's.
//! The newest leaf record shares the live content until a newer txg
//! dirties the block, at which point it gets its own snapshot.
//!
//! # Logging
//!
//! - **TRACE** `dbc::write` `dirty_record_new`: first dirty of a block in a txg
//! - **DEBUG** `dbc::write` `dirty_snapshot`: older txg's content preserved
//! - **DEBUG** `dbc::write` `override_discarded`: out-of-band block freed on re-dirty
//! - **DEBUG** `dbc::write` `override_settled`: out-of-band write finished
//! - **DEBUG** `dbc::write` `free_range`: level-0 range freed
//! - **DEBUG** `dbc::write` `rm_spill`: spill block dropped
//! - **DEBUG** `dbc::write` `dbuf_resize`: spill block size changed
//! - **WARN**  `dbc::write` `free_range_parent_failed`: covering indirect could not be dirtied

use crate::cache::CacheShared;
use crate::dbuf::{Dbuf, DbufInner, DbufState};
use crate::dirty::{DirtyRecord, OverrideState, RecordBody};
use crate::dnode::Dnode;
use crate::stats::bump;
use dbc_block::{BlockBuf, ReadFlags};
use dbc_error::{DbcError, Result};
use dbc_types::{
    BlkId, BlockPointer, BufIdentity, MAX_BLOCK_SHIFT, MIN_BLOCK_SHIFT, TXG_CONCURRENT_STATES, Txg,
};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl CacheShared {
    /// Create, or return, the `txg` dirty record of `db` and of all its
    /// ancestors.
    pub(crate) fn dirty(self: &Arc<Self>, db: &Arc<Dbuf>, txg: Txg) -> Result<Arc<DirtyRecord>> {
        let dnode = &db.dnode;
        let level = db.id.level;
        let special = db.id.blkid.is_special();
        let nlevels = dnode.nlevels();

        if let Some(dr) = self.existing_record(db, txg) {
            return Ok(dr);
        }

        let parent = if !special && level + 1 < nlevels {
            let parent_blkid = BlkId(db.id.blkid.0 >> dnode.epbs());
            Some(self.hold_impl(dnode, level + 1, parent_blkid, false)?)
        } else {
            None
        };
        self.note_dirty_dnode(dnode, txg);

        let mut guard = db.inner.lock();
        assert!(guard.holds > 0, "dirty of unheld buffer {}", db.id);
        if let Some(dr) = guard.record_for(txg).cloned() {
            if level == 0 {
                self.unoverride(db, &mut guard, &dr);
            }
            return Ok(dr);
        }
        let inner = &mut *guard;
        match inner.state {
            DbufState::Evicting => panic!("dirty of evicting buffer {}", db.id),
            DbufState::Cached | DbufState::Fill { .. } | DbufState::NoFill => {}
            state => assert!(level > 0, "dirty of {} in state {state:?}", db.id),
        }
        if let Some(newest) = inner.dirty.first() {
            assert!(
                txg.is_after(newest.txg()),
                "{} dirtied in txg {txg} after txg {}",
                db.id,
                newest.txg()
            );
        }
        assert!(
            inner.dirty.len() < TXG_CONCURRENT_STATES,
            "{} dirty in too many txgs",
            db.id
        );

        if level == 0 {
            self.fix_old_data(db, inner);
        }
        let dr = Arc::new(DirtyRecord::for_buffer(db, txg));
        inner.dirty.insert(0, Arc::clone(&dr));
        inner.holds += 1;
        if let DbufState::Read { freed } | DbufState::Fill { freed } = &mut inner.state {
            *freed = false;
        }
        drop(guard);

        self.txgs.add_dirty(txg, dr.accounted());
        trace!(target: "dbc::write", id = %db.id, txg = txg.0, "dirty_record_new");

        if special {
            if db.id.is_spill() {
                dnode.keep_spill(txg);
            }
            dnode.add_top_level(txg, Arc::clone(&dr));
            return Ok(dr);
        }
        if level == 0 {
            dnode.clear_freed(txg, db.id.blkid.0);
            dnode.new_blkid(db.id.blkid.0);
        }
        let Some(parent) = parent else {
            dnode.add_top_level(txg, Arc::clone(&dr));
            return Ok(dr);
        };
        match self.dirty(parent.dbuf(), txg) {
            Ok(parent_dr) => {
                DirtyRecord::adopt(&parent_dr, &dr);
                Ok(dr)
            }
            Err(err) => {
                let guard = db.inner.lock();
                let _ = self.retire_undirtied(db, guard, &dr);
                Err(err)
            }
        }
    }

    fn existing_record(&self, db: &Dbuf, txg: Txg) -> Option<Arc<DirtyRecord>> {
        let mut inner = db.inner.lock();
        let dr = inner.record_for(txg).cloned()?;
        if db.id.level == 0 {
            self.unoverride(db, &mut inner, &dr);
        }
        Some(dr)
    }

    /// Give the newest record its own copy of the live content before the
    /// live content changes on behalf of a later txg.
    pub(crate) fn fix_old_data(&self, db: &Dbuf, inner: &mut DbufInner) {
        let Some(newest) = inner.dirty.first() else {
            return;
        };
        let mut body = newest.body.lock();
        let RecordBody::Leaf { data, .. } = &mut *body else {
            return;
        };
        if data.is_some() {
            return;
        }
        let Some(live) = inner.data.as_ref() else {
            return;
        };
        if db.id.is_bonus() || inner.holds > inner.dirty_count() {
            // Shared until either side is next mutated.
            *data = Some(live.clone());
            bump(&self.stats.cow_copies);
            debug!(target: "dbc::write", id = %db.id, txg = newest.txg().0, "dirty_snapshot");
        } else {
            *data = inner.data.take();
            inner.state = DbufState::Uncached;
        }
    }

    /// Cancel an override of `dr`, waiting out one in flight.
    fn unoverride(&self, db: &Dbuf, inner: &mut MutexGuard<'_, DbufInner>, dr: &DirtyRecord) {
        loop {
            let mut body = dr.body.lock();
            let RecordBody::Leaf { override_state, .. } = &mut *body else {
                return;
            };
            let current = *override_state;
            match current {
                OverrideState::NotOverridden => return,
                OverrideState::InDmuSync => {
                    drop(body);
                    db.changed.wait(inner);
                }
                OverrideState::Overridden(bp) => {
                    *override_state = OverrideState::NotOverridden;
                    drop(body);
                    if !bp.is_hole() {
                        self.store.free_block(dr.txg(), &bp);
                    }
                    debug!(
                        target: "dbc::write",
                        id = %db.id,
                        txg = dr.txg().0,
                        address = bp.address,
                        "override_discarded"
                    );
                    return;
                }
            }
        }
    }

    /// Drop `dr` from `db` and from the tree. Returns the guard unless the
    /// buffer was destroyed.
    fn retire_undirtied<'a>(
        &self,
        db: &'a Arc<Dbuf>,
        mut inner: MutexGuard<'a, DbufInner>,
        dr: &Arc<DirtyRecord>,
    ) -> Option<MutexGuard<'a, DbufInner>> {
        inner.dirty.retain(|r| !Arc::ptr_eq(r, dr));
        match dr.parent() {
            Some(parent) => parent.remove_child(dr),
            None => db.dnode.remove_top_level(dr.txg(), dr),
        }
        if db.id.level == 0 && inner.state != DbufState::NoFill {
            self.unoverride(db, &mut inner, dr);
        }
        self.txgs.undirty(dr.txg(), dr.accounted());
        inner.holds -= 1;
        if inner.holds == 0 {
            self.destroy(db, inner);
            return None;
        }
        Some(inner)
    }

    /// Undo the `txg` changes of a level-0 buffer. True if it was destroyed.
    pub(crate) fn undirty(&self, db: &Arc<Dbuf>, txg: Txg) -> bool {
        let inner = db.inner.lock();
        if inner.state == DbufState::Evicting {
            return false;
        }
        assert!(
            db.id.level == 0 && !db.id.is_bonus(),
            "undirty of non-leaf buffer {}",
            db.id
        );
        let Some(dr) = inner.record_for(txg).cloned() else {
            return false;
        };
        assert!(
            !inner.data_pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, &dr)),
            "undirty of syncing record {} txg {txg}",
            db.id
        );
        self.retire_undirtied(db, inner, &dr).is_none()
    }

    pub(crate) fn will_dirty(self: &Arc<Self>, db: &Arc<Dbuf>, txg: Txg) -> Result<Arc<DirtyRecord>> {
        if db.id.level == 0 {
            if let Some(dr) = self.existing_record(db, txg) {
                if db.inner.lock().state == DbufState::Cached {
                    return Ok(dr);
                }
            }
        }
        self.read(db, ReadFlags::NO_PREFETCH)?;
        self.dirty(db, txg)
    }

    fn wait_not_busy(db: &Dbuf, inner: &mut MutexGuard<'_, DbufInner>) {
        while inner.state.is_busy() {
            db.changed.wait(inner);
        }
    }

    pub(crate) fn will_fill(self: &Arc<Self>, db: &Arc<Dbuf>, txg: Txg) -> Result<()> {
        if db.id.level != 0 || db.id.is_bonus() {
            return Err(DbcError::Format(format!("{} cannot be filled", db.id)));
        }
        {
            let mut inner = db.inner.lock();
            Self::wait_not_busy(db, &mut inner);
            match inner.state {
                DbufState::Uncached => {
                    inner.data = Some(BlockBuf::zeroed(db.size()));
                    inner.state = DbufState::Fill { freed: false };
                    inner.last_error = None;
                }
                DbufState::NoFill => inner.data = None,
                DbufState::Cached => {}
                state => panic!("fill of {} in state {state:?}", db.id),
            }
        }
        if let Err(err) = self.dirty(db, txg) {
            let mut inner = db.inner.lock();
            if matches!(inner.state, DbufState::Fill { .. }) {
                inner.state = DbufState::Uncached;
                inner.data = None;
                db.changed.notify_all();
            }
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn fill_done(&self, db: &Dbuf) {
        let mut inner = db.inner.lock();
        if let DbufState::Fill { freed } = inner.state {
            if freed {
                inner.data = Some(BlockBuf::zeroed(db.size()));
            }
            inner.state = DbufState::Cached;
            db.changed.notify_all();
        }
    }

    pub(crate) fn will_not_fill(self: &Arc<Self>, db: &Arc<Dbuf>, txg: Txg) -> Result<()> {
        if db.id.level != 0 || db.id.is_bonus() {
            return Err(DbcError::Format(format!("{} cannot be dirtied without content", db.id)));
        }
        {
            let mut guard = db.inner.lock();
            Self::wait_not_busy(db, &mut guard);
            let inner = &mut *guard;
            self.fix_old_data(db, inner);
            inner.state = DbufState::NoFill;
            inner.data = None;
        }
        self.dirty(db, txg).map(|_| ())
    }

    /// Run `f` on the live content of a cached or filling buffer.
    fn mutate_live<R>(db: &Dbuf, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut inner = db.inner.lock();
        if !matches!(inner.state, DbufState::Cached | DbufState::Fill { .. }) {
            return Err(DbcError::Format(format!(
                "{} has no content to modify ({:?})",
                db.id, inner.state
            )));
        }
        let data = inner
            .data
            .as_mut()
            .ok_or_else(|| DbcError::Format(format!("{} has no content to modify", db.id)))?;
        Ok(f(data.make_mut()))
    }

    pub(crate) fn write_at(
        self: &Arc<Self>,
        db: &Arc<Dbuf>,
        txg: Txg,
        offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        if db.id.level != 0 {
            return Err(DbcError::Format(format!("{} is not a data block", db.id)));
        }
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= db.size())
            .ok_or_else(|| {
                DbcError::Format(format!(
                    "write of {} bytes at {offset} exceeds block size {}",
                    bytes.len(),
                    db.size()
                ))
            })?;
        let whole = offset == 0 && end == db.size() && !db.id.is_bonus();
        if whole {
            self.will_fill(db, txg)?;
        } else {
            self.will_dirty(db, txg)?;
        }
        let copied = Self::mutate_live(db, |live| live[offset..end].copy_from_slice(bytes));
        if whole {
            self.fill_done(db);
        }
        copied
    }

    pub(crate) fn modify<R>(
        self: &Arc<Self>,
        db: &Arc<Dbuf>,
        txg: Txg,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.will_dirty(db, txg)?;
        Self::mutate_live(db, f)
    }

    pub(crate) fn assign_content(self: &Arc<Self>, db: &Arc<Dbuf>, buf: BlockBuf, txg: Txg) -> Result<()> {
        if db.id.level != 0 || db.id.blkid.is_special() {
            return Err(DbcError::Format(format!("{} cannot take assigned content", db.id)));
        }
        if buf.len() != db.size() {
            return Err(DbcError::Format(format!(
                "assigned {} bytes to a {} byte block",
                buf.len(),
                db.size()
            )));
        }

        let mut guard = db.inner.lock();
        Self::wait_not_busy(db, &mut guard);
        let inner = &mut *guard;
        if inner.state == DbufState::Cached && inner.holds - 1 > inner.dirty_count() {
            // Other holders see the live content: copy into it instead.
            drop(guard);
            self.dirty(db, txg)?;
            return Self::mutate_live(db, |live| live.copy_from_slice(buf.as_slice()));
        }
        let prev_state = inner.state;
        let mut handed_to = None;
        if inner.state == DbufState::Cached {
            if let Some(newest) = inner.dirty.first().filter(|dr| dr.txg() != txg) {
                if let RecordBody::Leaf { data: shared @ None, .. } = &mut *newest.body.lock() {
                    *shared = inner.data.take();
                    handed_to = Some(Arc::clone(newest));
                }
            }
        }
        let prev_data = inner.data.replace(buf);
        inner.state = DbufState::Fill { freed: false };
        drop(guard);

        if let Err(err) = self.dirty(db, txg) {
            // Nothing was dirtied: put back what the buffer held before.
            let mut inner = db.inner.lock();
            if let DbufState::Fill { freed } = inner.state {
                if freed {
                    inner.data = Some(BlockBuf::zeroed(db.size()));
                    inner.state = DbufState::Cached;
                } else {
                    inner.data = match &handed_to {
                        Some(dr) => match &mut *dr.body.lock() {
                            RecordBody::Leaf { data, .. } => data.take(),
                            _ => None,
                        },
                        None => prev_data,
                    };
                    inner.state = prev_state;
                }
                db.changed.notify_all();
            }
            return Err(err);
        }
        self.fill_done(db);
        Ok(())
    }

    pub(crate) fn loan_content(self: &Arc<Self>, db: &Arc<Dbuf>) -> Result<BlockBuf> {
        if db.id.level != 0 || db.id.blkid.is_special() {
            return Err(DbcError::Format(format!("{} cannot be loaned", db.id)));
        }
        self.read(db, ReadFlags::NO_PREFETCH)?;
        let mut inner = db.inner.lock();
        if inner.holds > 1 {
            return Err(DbcError::ContentShared {
                holders: inner.holds - 1,
            });
        }
        let data = inner.data.take().ok_or_else(|| DbcError::ReadFailed {
            block: inner.bp.map_or(0, |bp| bp.address),
            detail: format!("{} has no content to loan", db.id),
        })?;
        inner.state = DbufState::Uncached;
        Ok(data)
    }

    pub(crate) fn pending_content(&self, db: &Dbuf, txg: Txg) -> Option<BlockBuf> {
        let inner = db.inner.lock();
        let dr = inner.record_for(txg)?;
        let body = dr.body.lock();
        match &*body {
            RecordBody::Leaf { data: Some(data), .. } => Some(data.clone()),
            _ => inner.data.clone(),
        }
    }

    pub(crate) fn begin_override(&self, db: &Dbuf, txg: Txg) -> Result<BlockBuf> {
        if db.id.level != 0 || db.id.is_bonus() {
            return Err(DbcError::Format(format!("{} cannot be overridden", db.id)));
        }
        let inner = db.inner.lock();
        let dr = inner
            .record_for(txg)
            .cloned()
            .ok_or_else(|| DbcError::NotFound(format!("{} is not dirty in txg {txg}", db.id)))?;
        if inner.data_pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, &dr)) {
            return Err(DbcError::Incomplete);
        }
        let mut body = dr.body.lock();
        let RecordBody::Leaf { data, override_state } = &mut *body else {
            return Err(DbcError::Format(format!("{} is not a leaf", db.id)));
        };
        if *override_state != OverrideState::NotOverridden {
            return Err(DbcError::Incomplete);
        }
        *override_state = OverrideState::InDmuSync;
        Ok(data
            .clone()
            .or_else(|| inner.data.clone())
            .unwrap_or_else(|| BlockBuf::zeroed(db.size())))
    }

    /// Finish an override: adopt `bp`, or abandon with `None`.
    pub(crate) fn settle_override(&self, db: &Dbuf, txg: Txg, bp: Option<BlockPointer>) -> Result<()> {
        let inner = db.inner.lock();
        let dr = inner
            .record_for(txg)
            .ok_or_else(|| DbcError::NotFound(format!("{} is not dirty in txg {txg}", db.id)))?;
        let mut body = dr.body.lock();
        let RecordBody::Leaf { override_state, .. } = &mut *body else {
            return Err(DbcError::Format(format!("{} is not a leaf", db.id)));
        };
        if *override_state != OverrideState::InDmuSync {
            return Err(DbcError::Format(format!("no override of {} in progress", db.id)));
        }
        *override_state = bp.map_or(OverrideState::NotOverridden, OverrideState::Overridden);
        drop(body);
        db.changed.notify_all();
        debug!(
            target: "dbc::write",
            id = %db.id,
            txg = txg.0,
            adopted = bp.is_some(),
            "override_settled"
        );
        Ok(())
    }

    /// Free level-0 blocks `start..=end` in `txg`. Cached copies are zeroed
    /// or dropped, and the covering level-1 blocks are dirtied so the freed
    /// slots become holes when `txg` syncs.
    pub(crate) fn free_range(self: &Arc<Self>, dnode: &Arc<Dnode>, start: u64, end: u64, txg: Txg) {
        self.note_dirty_dnode(dnode, txg);
        dnode.record_freed(txg, start, end);
        let end = end.min(dnode.max_blkid());
        if start > end {
            return;
        }
        debug!(
            target: "dbc::write",
            object = dnode.object().0,
            start,
            end,
            txg = txg.0,
            "free_range"
        );

        for index in dnode.dbufs_in(0, start, end) {
            if let Some(db) = self.arena.get(index) {
                self.free_cached(&db, txg);
            }
        }

        if dnode.nlevels() > 1 {
            let epbs = dnode.epbs();
            for l1 in (start >> epbs)..=(end >> epbs) {
                let dirtied = self
                    .hold_impl(dnode, 1, BlkId(l1), false)
                    .and_then(|parent| self.will_dirty(parent.dbuf(), txg).map(drop));
                if let Err(err) = dirtied {
                    warn!(target: "dbc::write", object = dnode.object().0, blkid = l1, error = %err, "free_range_parent_failed");
                }
            }
        }
    }

    /// Drop the `txg` changes of a freed block and zero or destroy its
    /// cached copy.
    fn free_cached(&self, db: &Arc<Dbuf>, txg: Txg) {
        let mut guard = db.inner.lock();
        if guard.state == DbufState::Evicting {
            return;
        }
        if let Some(dr) = guard.record_for(txg).cloned() {
            match self.retire_undirtied(db, guard, &dr) {
                Some(g) => guard = g,
                None => return,
            }
        }
        match guard.state {
            DbufState::Uncached | DbufState::NoFill | DbufState::Evicting => return,
            DbufState::Read { ref mut freed } | DbufState::Fill { ref mut freed } => {
                *freed = true;
                return;
            }
            DbufState::Cached => {}
        }
        if guard.holds == 0 {
            self.tier_remove(db, &mut guard);
            self.destroy(db, guard);
            return;
        }
        if !guard.dirty.is_empty() {
            self.fix_old_data(db, &mut guard);
        }
        if let Some(data) = guard.data.as_mut() {
            data.make_mut().fill(0);
        }
    }

    /// Drop the object's spill block in `txg`. The block pointer becomes a
    /// hole when `txg` syncs; until then the spill reads as zeros.
    pub(crate) fn rm_spill(&self, dnode: &Arc<Dnode>, txg: Txg) {
        self.note_dirty_dnode(dnode, txg);
        dnode.record_spill_removed(txg);
        debug!(target: "dbc::write", object = dnode.object().0, txg = txg.0, "rm_spill");
        for index in dnode.dbufs_in(0, BlkId::SPILL.0, BlkId::SPILL.0) {
            if let Some(db) = self.arena.get(index) {
                self.free_cached(&db, txg);
            }
        }
    }

    /// Give the spill block a new size in `txg`. The leading bytes are
    /// kept and growth is zero-filled. Sizes are rounded up to whole
    /// sectors and capped at the largest block.
    pub(crate) fn resize(self: &Arc<Self>, db: &Arc<Dbuf>, size: usize, txg: Txg) -> Result<()> {
        if !db.id.is_spill() {
            return Err(DbcError::Format(format!("{} cannot be resized", db.id)));
        }
        let sector = 1_usize << MIN_BLOCK_SHIFT;
        let size = size.max(sector).div_ceil(sector).saturating_mul(sector).min(1_usize << MAX_BLOCK_SHIFT);
        self.will_dirty(db, txg)?;

        let mut guard = db.inner.lock();
        let old = db.size();
        if old == size {
            return Ok(());
        }
        let inner = &mut *guard;
        let mut content = inner.data.take().map(|d| d.as_slice().to_vec()).unwrap_or_default();
        content.resize(size, 0);
        let content = BlockBuf::new(content);
        inner.data = Some(content.clone());
        db.set_size(size);
        if let Some(dr) = inner.record_for(txg) {
            if let RecordBody::Leaf { data: own @ Some(_), .. } = &mut *dr.body.lock() {
                *own = Some(content);
            }
        }
        debug!(target: "dbc::write", id = %db.id, txg = txg.0, old, size, "dbuf_resize");
        Ok(())
    }

    pub(crate) fn dirty_lightweight_leaf(
        self: &Arc<Self>,
        dnode: &Arc<Dnode>,
        blkid: BlkId,
        data: BlockBuf,
        txg: Txg,
    ) -> Result<Arc<DirtyRecord>> {
        if blkid.is_special() {
            return Err(DbcError::Format(format!("{blkid} cannot be written lightweight")));
        }
        if data.len() != dnode.block_size(0, blkid) {
            return Err(DbcError::Format(format!(
                "lightweight write of {} bytes to a {} byte block",
                data.len(),
                dnode.data_block_size()
            )));
        }
        if blkid.0 >= dnode.capacity(0) {
            return Err(DbcError::NoSpace);
        }
        let id = BufIdentity::new(dnode.objset(), dnode.object(), 0, blkid);
        assert!(
            !self.hash.contains(&self.arena, &id),
            "lightweight dirty of cached block {id}"
        );

        let nlevels = dnode.nlevels();
        let parent = if nlevels > 1 {
            Some(self.hold_impl(dnode, 1, BlkId(blkid.0 >> dnode.epbs()), false)?)
        } else {
            None
        };
        let parent_dr = match &parent {
            Some(parent) => Some(self.dirty(parent.dbuf(), txg)?),
            None => None,
        };

        self.note_dirty_dnode(dnode, txg);
        dnode.clear_freed(txg, blkid.0);
        dnode.new_blkid(blkid.0);
        let dr = Arc::new(DirtyRecord::lightweight(dnode, blkid, data, txg));
        self.txgs.add_dirty(txg, dr.accounted());
        match parent_dr {
            Some(parent_dr) => DirtyRecord::adopt(&parent_dr, &dr),
            None => dnode.add_top_level(txg, Arc::clone(&dr)),
        }
        trace!(target: "dbc::write", %id, txg = txg.0, "dirty_record_new");
        Ok(dr)
    }
}
