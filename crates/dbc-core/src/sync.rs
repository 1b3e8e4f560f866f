//! Sync pipeline: turn a txg's dirty records into block writes.
//!
//! Records are synced top-down but written bottom-up. An indirect block's
//! write is deferred behind a [`PendingWrite`] counter until every child
//! write has completed and installed its new block pointer into the
//! indirect's content. Each completion frees the block it replaces,
//! charges the size difference to the object, retires the record and
//! releases its hold.
//!
//! # Logging
//!
//! - **DEBUG** `dbc::sync` `sync_dnode`: start of an object's sync
//! - **TRACE** `dbc::sync` `sync_write_issue`: block write handed to the store
//! - **TRACE** `dbc::sync` `sync_write_done`: block pointer installed
//! - **DEBUG** `dbc::sync` `sync_override_adopted`: out-of-band block used as-is
//! - **DEBUG** `dbc::sync` `sync_punch_holes`: freed blocks replaced by holes
//! - **WARN**  `dbc::sync` `txg_write_error`: write failed, recorded on the txg
//! - **WARN**  `dbc::sync` `install_skipped`: no parent content to install into

use crate::cache::CacheShared;
use crate::dbuf::Dbuf;
use crate::dirty::{DirtyRecord, OverrideState, RecordBody, RecordOwner};
use crate::dnode::Dnode;
use crate::stats::bump;
use dbc_block::{BlockBuf, IoPriority, ReadFlags, WriteRequest};
use dbc_error::{DbcError, Result};
use dbc_types::{BLKPTR_SIZE, BlkId, BlockPointer, BufIdentity, Txg};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

type IssueFn = Box<dyn FnOnce() + Send + 'static>;

/// Deferred write of an indirect block, released by its last child.
///
/// Starts with one guard count held by the syncing thread so the write
/// cannot fire while children are still being issued.
pub(crate) struct PendingWrite {
    remaining: AtomicUsize,
    issue: Mutex<Option<IssueFn>>,
}

impl PendingWrite {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(1),
            issue: Mutex::new(None),
        })
    }

    fn set_issue(&self, issue: IssueFn) {
        *self.issue.lock() = Some(issue);
    }

    fn add_child(&self) {
        self.remaining.fetch_add(1, Ordering::AcqRel);
    }

    fn child_done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let issue = self.issue.lock().take();
            if let Some(issue) = issue {
                issue();
            }
        }
    }
}

fn psize_i64(bp: &BlockPointer) -> i64 {
    if bp.is_hole() {
        0
    } else {
        i64::from(bp.psize)
    }
}

/// Sum of child fill counts in an indirect block.
fn fill_count(content: &BlockBuf) -> u64 {
    let data = content.as_slice();
    (0..data.len() / BLKPTR_SIZE)
        .filter_map(|slot| BlockPointer::decode_slot(data, slot).ok())
        .filter(|bp| !bp.is_hole())
        .map(|bp| bp.fill)
        .sum()
}

impl CacheShared {
    pub(crate) fn sync_dnode(self: &Arc<Self>, dnode: &Arc<Dnode>, txg: Txg) {
        let records = dnode.take_top_level(txg);
        let level = dnode.nlevels() - 1;
        debug!(
            target: "dbc::sync",
            objset = dnode.objset().0,
            object = dnode.object().0,
            txg = txg.0,
            records = records.len(),
            "sync_dnode"
        );
        if level == 0 {
            self.punch_root_holes(dnode, txg);
        }
        self.punch_spill(dnode, txg);
        self.sync_list(records, level, txg, None);
        dnode.retire_txg(txg);
    }

    pub(crate) fn sync_list(
        self: &Arc<Self>,
        records: Vec<Arc<DirtyRecord>>,
        level: u8,
        txg: Txg,
        parent: Option<&Arc<PendingWrite>>,
    ) {
        for dr in records {
            assert_eq!(dr.txg(), txg, "record of txg {} synced in txg {txg}", dr.txg());
            let Some(db) = dr.buffer().cloned() else {
                self.sync_lightweight(&dr, parent);
                continue;
            };
            if !db.id.blkid.is_special() {
                assert_eq!(db.id.level, level, "{} synced at level {level}", db.id);
            }
            if db.id.level > 0 {
                self.sync_indirect(&db, &dr, parent);
            } else {
                self.sync_leaf(&db, &dr, parent);
            }
        }
    }

    /// Make sure `db` knows its block pointer and, below the top level,
    /// holds its parent. Returns the pointer being replaced.
    fn check_blkptr(self: &Arc<Self>, db: &Arc<Dbuf>) -> Result<Option<BlockPointer>> {
        let dnode = &db.dnode;
        let needs_parent = !db.id.blkid.is_special() && db.id.level + 1 < dnode.nlevels();
        {
            let mut inner = db.inner.lock();
            if !needs_parent {
                if inner.bp.is_none() {
                    inner.bp = if db.id.is_spill() {
                        Some(dnode.spill_blkptr())
                    } else {
                        let index = usize::try_from(db.id.blkid.0).map_err(|_| DbcError::NoSpace)?;
                        dnode.root_blkptr(index)
                    };
                }
                return Ok(inner.bp);
            }
            if inner.parent.is_some() && inner.bp.is_some() {
                return Ok(inner.bp);
            }
        }

        let parent_blkid = BlkId(db.id.blkid.0 >> dnode.epbs());
        let parent = self.hold_impl(dnode, db.id.level + 1, parent_blkid, false)?;
        self.read(parent.dbuf(), ReadFlags::NO_PREFETCH)?;
        let bp = self.child_blkptr(parent.dbuf(), dnode.child_slot(db.id.blkid.0))?;
        let (spare, current) = {
            let mut inner = db.inner.lock();
            let spare = if inner.parent.is_none() {
                inner.parent = Some(parent.transfer());
                None
            } else {
                Some(parent)
            };
            if inner.bp.is_none() {
                inner.bp = Some(bp);
            }
            (spare, inner.bp)
        };
        drop(spare);
        Ok(current)
    }

    fn sync_bonus(&self, db: &Arc<Dbuf>, dr: &Arc<DirtyRecord>) {
        let mut inner = db.inner.lock();
        let owned = dr.owned_content();
        if let Some(content) = owned.or_else(|| inner.data.clone()) {
            let mut phys = db.dnode.phys.write();
            let mut bytes = content.into_inner();
            bytes.resize(db.dnode.bonus_len(), 0);
            phys.bonus = bytes;
        }
        inner.dirty.retain(|r| !Arc::ptr_eq(r, dr));
        db.changed.notify_all();
        drop(inner);
        self.txgs.undirty(dr.txg(), dr.accounted());
        self.rele(db);
    }

    fn sync_leaf(self: &Arc<Self>, db: &Arc<Dbuf>, dr: &Arc<DirtyRecord>, parent: Option<&Arc<PendingWrite>>) {
        if db.id.is_bonus() {
            self.sync_bonus(db, dr);
            return;
        }
        let txg = dr.txg();
        if let Some(p) = parent {
            p.add_child();
        }
        self.txgs.write_issued(txg);
        let parent = parent.cloned();

        let old_bp = match self.check_blkptr(db) {
            Ok(bp) => bp,
            Err(err) => {
                self.write_done(db, dr, None, Err(err), parent, None);
                return;
            }
        };

        let mut inner = db.inner.lock();
        while dr.override_state() == Some(OverrideState::InDmuSync) {
            db.changed.wait(&mut inner);
        }
        let adopted = match dr.override_state() {
            Some(OverrideState::Overridden(bp)) => Some(bp),
            _ => None,
        };
        let snapshot = {
            let mut body = dr.body.lock();
            match &mut *body {
                RecordBody::Leaf { data, .. } => {
                    let snap = data
                        .clone()
                        .or_else(|| inner.data.clone())
                        .unwrap_or_else(|| BlockBuf::zeroed(db.size()));
                    *data = Some(snap.clone());
                    snap
                }
                _ => BlockBuf::zeroed(db.size()),
            }
        };
        inner.data_pending = Some(Arc::clone(dr));
        drop(inner);

        if let Some(bp) = adopted {
            bump(&self.stats.overrides_adopted);
            debug!(target: "dbc::sync", id = %db.id, txg = txg.0, address = bp.address, "sync_override_adopted");
            self.write_done(db, dr, old_bp, Ok(bp), parent, None);
            return;
        }
        self.issue_write(db, dr, snapshot, old_bp, parent, false);
    }

    fn sync_indirect(self: &Arc<Self>, db: &Arc<Dbuf>, dr: &Arc<DirtyRecord>, parent: Option<&Arc<PendingWrite>>) {
        let txg = dr.txg();
        if let Some(p) = parent {
            p.add_child();
        }
        self.txgs.write_issued(txg);
        let parent = parent.cloned();

        let prepared = self
            .read(db, ReadFlags::NO_PREFETCH)
            .and_then(|()| self.check_blkptr(db));
        if prepared.is_ok() {
            self.punch_child_holes(db, txg);
        }
        db.inner.lock().data_pending = Some(Arc::clone(dr));

        let pending = PendingWrite::new();
        {
            let shared = Arc::clone(self);
            let db = Arc::clone(db);
            let dr = Arc::clone(dr);
            pending.set_issue(Box::new(move || shared.issue_indirect(&db, &dr, prepared, parent)));
        }
        let children = dr.take_children();
        self.sync_list(children, db.id.level - 1, txg, Some(&pending));
        pending.child_done();
    }

    fn issue_indirect(
        self: &Arc<Self>,
        db: &Arc<Dbuf>,
        dr: &Arc<DirtyRecord>,
        prepared: Result<Option<BlockPointer>>,
        parent: Option<Arc<PendingWrite>>,
    ) {
        let old_bp = match prepared {
            Ok(bp) => bp,
            Err(err) => {
                self.write_done(db, dr, None, Err(err), parent, None);
                return;
            }
        };
        let snapshot = {
            let _bp_guard = db.bp_lock.read();
            db.inner.lock().data.clone()
        };
        let Some(snapshot) = snapshot else {
            let err = DbcError::WriteFailed {
                txg: dr.txg().0,
                detail: format!("indirect {} lost its content", db.id),
            };
            self.write_done(db, dr, old_bp, Err(err), parent, None);
            return;
        };
        self.issue_write(db, dr, snapshot, old_bp, parent, true);
    }

    fn issue_write(
        self: &Arc<Self>,
        db: &Arc<Dbuf>,
        dr: &Arc<DirtyRecord>,
        content: BlockBuf,
        old_bp: Option<BlockPointer>,
        parent: Option<Arc<PendingWrite>>,
        indirect: bool,
    ) {
        let request = WriteRequest {
            objset: db.id.objset,
            object: db.id.object,
            level: db.id.level,
            blkid: db.id.blkid,
            txg: dr.txg(),
            data: content.clone(),
            policy: db.dnode.write_policy(db.id.level),
            priority: IoPriority::SyncWrite,
        };
        trace!(target: "dbc::sync", id = %db.id, txg = dr.txg().0, "sync_write_issue");
        let shared = Arc::clone(self);
        let db = Arc::clone(db);
        let dr = Arc::clone(dr);
        let fill_source = indirect.then_some(content);
        self.store.write_block(
            request,
            Box::new(move |result| shared.write_done(&db, &dr, old_bp, result, parent, fill_source)),
        );
    }

    /// Charge the size change and free the replaced block.
    fn replace_block(&self, dnode: &Dnode, txg: Txg, old: Option<BlockPointer>, new: &BlockPointer) {
        let old_size = old.as_ref().map_or(0, psize_i64);
        dnode.diduse_space(psize_i64(new) - old_size);
        if let Some(old) = old.filter(|o| !o.is_hole() && o.address != new.address) {
            self.store.free_block(txg, &old);
        }
    }

    fn install_in_parent(parent: &Dbuf, slot: usize, bp: &BlockPointer, child: BufIdentity) {
        let _bp_guard = parent.bp_lock.write();
        let mut inner = parent.inner.lock();
        let Some(content) = inner.data.as_mut() else {
            warn!(target: "dbc::sync", %child, parent = %parent.id, "install_skipped");
            return;
        };
        if let Err(err) = bp.encode_slot(content.make_mut(), slot) {
            warn!(target: "dbc::sync", %child, parent = %parent.id, error = %err, "install_skipped");
        }
    }

    fn install_blkptr(&self, db: &Dbuf, bp: &BlockPointer) {
        let dnode = &db.dnode;
        if db.id.is_spill() {
            dnode.set_spill_blkptr(*bp);
            return;
        }
        if db.id.level + 1 >= dnode.nlevels() {
            let installed = usize::try_from(db.id.blkid.0)
                .map_err(|_| DbcError::NoSpace)
                .and_then(|index| dnode.set_root_blkptr(index, *bp));
            if let Err(err) = installed {
                warn!(target: "dbc::sync", id = %db.id, error = %err, "install_skipped");
            }
            return;
        }
        let parent = db.inner.lock().parent.and_then(|idx| self.arena.get(idx));
        match parent {
            Some(parent) => {
                Self::install_in_parent(&parent, dnode.child_slot(db.id.blkid.0), bp, db.id);
            }
            None => warn!(target: "dbc::sync", id = %db.id, "install_skipped"),
        }
    }

    /// Completion of a buffer-backed write, or of a failure to start one.
    fn write_done(
        &self,
        db: &Arc<Dbuf>,
        dr: &Arc<DirtyRecord>,
        old_bp: Option<BlockPointer>,
        result: Result<BlockPointer>,
        parent: Option<Arc<PendingWrite>>,
        fill_source: Option<BlockBuf>,
    ) {
        let txg = dr.txg();
        match result {
            Ok(mut bp) => {
                bp.fill = if bp.is_hole() {
                    0
                } else if db.id.level == 0 {
                    1
                } else {
                    fill_source.as_ref().map_or(0, fill_count)
                };
                self.replace_block(&db.dnode, txg, old_bp, &bp);
                db.inner.lock().bp = Some(bp);
                self.install_blkptr(db, &bp);
                if db.id.level == 0 && !db.id.blkid.is_special() {
                    db.dnode.new_blkid(db.id.blkid.0);
                }
                bump(&self.stats.writes);
                trace!(target: "dbc::sync", id = %db.id, txg = txg.0, address = bp.address, "sync_write_done");
            }
            Err(err) => {
                bump(&self.stats.write_errors);
                self.txgs.record_error(txg, &err);
            }
        }

        let mut inner = db.inner.lock();
        inner.dirty.retain(|r| !Arc::ptr_eq(r, dr));
        if inner.data_pending.as_ref().is_some_and(|p| Arc::ptr_eq(p, dr)) {
            inner.data_pending = None;
        }
        db.changed.notify_all();
        drop(inner);

        self.txgs.write_done(txg, dr.accounted());
        self.rele(db);
        if let Some(parent) = parent {
            parent.child_done();
        }
    }

    fn sync_lightweight(self: &Arc<Self>, dr: &Arc<DirtyRecord>, parent: Option<&Arc<PendingWrite>>) {
        let RecordOwner::Lightweight(dnode) = &dr.owner else {
            return;
        };
        let dnode = Arc::clone(dnode);
        let txg = dr.txg();
        if let Some(p) = parent {
            p.add_child();
        }
        self.txgs.write_issued(txg);
        let parent = parent.cloned();

        let blkid = dr.identity().blkid;
        let slot = dnode.child_slot(blkid.0);
        let parent_db = dr.parent().and_then(|p| p.buffer().cloned());
        let old_bp = match &parent_db {
            Some(pdb) => self.child_blkptr(pdb, slot).ok(),
            None => usize::try_from(blkid.0).ok().and_then(|i| dnode.root_blkptr(i)),
        };
        let data = dr.owned_content().unwrap_or_else(|| BlockBuf::zeroed(dnode.block_size(0, blkid)));
        let request = WriteRequest {
            objset: dnode.objset(),
            object: dnode.object(),
            level: 0,
            blkid,
            txg,
            data,
            policy: dnode.write_policy(0),
            priority: IoPriority::SyncWrite,
        };
        trace!(target: "dbc::sync", id = %dr.identity(), txg = txg.0, "sync_write_issue");
        let shared = Arc::clone(self);
        let dr = Arc::clone(dr);
        self.store.write_block(
            request,
            Box::new(move |result| {
                shared.lightweight_done(&dnode, &dr, parent_db.as_deref(), old_bp, result, parent);
            }),
        );
    }

    fn lightweight_done(
        &self,
        dnode: &Dnode,
        dr: &DirtyRecord,
        parent_db: Option<&Dbuf>,
        old_bp: Option<BlockPointer>,
        result: Result<BlockPointer>,
        parent: Option<Arc<PendingWrite>>,
    ) {
        let txg = dr.txg();
        let blkid = dr.identity().blkid;
        match result {
            Ok(mut bp) => {
                bp.fill = u64::from(!bp.is_hole());
                self.replace_block(dnode, txg, old_bp, &bp);
                match parent_db {
                    Some(pdb) => Self::install_in_parent(pdb, dnode.child_slot(blkid.0), &bp, dr.identity()),
                    None => {
                        let installed = usize::try_from(blkid.0)
                            .map_err(|_| DbcError::NoSpace)
                            .and_then(|index| dnode.set_root_blkptr(index, bp));
                        if let Err(err) = installed {
                            warn!(target: "dbc::sync", id = %dr.identity(), error = %err, "install_skipped");
                        }
                    }
                }
                bump(&self.stats.writes);
                trace!(target: "dbc::sync", id = %dr.identity(), txg = txg.0, "sync_write_done");
            }
            Err(err) => {
                bump(&self.stats.write_errors);
                self.txgs.record_error(txg, &err);
            }
        }
        self.txgs.write_done(txg, dr.accounted());
        if let Some(parent) = parent {
            parent.child_done();
        }
    }

    /// Replace freed children of a level-1 block with holes born in `txg`.
    fn punch_child_holes(&self, db: &Dbuf, txg: Txg) {
        if db.id.level != 1 {
            return;
        }
        let dnode = &db.dnode;
        let first = db.id.blkid.0 << dnode.epbs();
        let span = 1_u64 << dnode.epbs();
        let freed: Vec<u64> = {
            let dirty = dnode.dirty.lock();
            let Some(ranges) = dirty.freed.get(&txg) else {
                return;
            };
            (first..first + span).filter(|b| ranges.contains(*b)).collect()
        };
        if freed.is_empty() {
            return;
        }

        let mut punched = Vec::new();
        {
            let _bp_guard = db.bp_lock.write();
            let mut inner = db.inner.lock();
            let Some(content) = inner.data.as_mut() else {
                return;
            };
            let bytes = content.make_mut();
            for blkid in freed {
                let slot = usize::try_from(blkid - first).unwrap_or(0);
                let Ok(old) = BlockPointer::decode_slot(bytes, slot) else {
                    continue;
                };
                if old.is_hole() {
                    continue;
                }
                let hole = BlockPointer::hole(dnode.data_block_size(), old.object_type, 0, txg);
                if hole.encode_slot(bytes, slot).is_ok() {
                    punched.push((blkid, old, hole));
                }
            }
        }
        self.retire_punched(dnode, txg, punched);
    }

    /// Replace freed root slots of a single-level object with holes.
    fn punch_root_holes(&self, dnode: &Dnode, txg: Txg) {
        let mut punched = Vec::new();
        {
            let dirty = dnode.dirty.lock();
            let Some(ranges) = dirty.freed.get(&txg) else {
                return;
            };
            let mut phys = dnode.phys.write();
            for (index, slot) in phys.blkptr.iter_mut().enumerate() {
                let blkid = u64::try_from(index).unwrap_or(u64::MAX);
                if !ranges.contains(blkid) || slot.is_hole() {
                    continue;
                }
                let old = *slot;
                *slot = BlockPointer::hole(dnode.data_block_size(), old.object_type, 0, txg);
                punched.push((blkid, old, *slot));
            }
        }
        self.retire_punched(dnode, txg, punched);
    }

    fn punch_spill(&self, dnode: &Dnode, txg: Txg) {
        if !dnode.take_spill_removed(txg) {
            return;
        }
        let punched = {
            let mut phys = dnode.phys.write();
            let old = phys.spill;
            if old.is_hole() {
                return;
            }
            phys.spill = BlockPointer::hole(old.lsize, old.object_type, 0, txg);
            vec![(BlkId::SPILL.0, old, phys.spill)]
        };
        self.retire_punched(dnode, txg, punched);
    }

    fn retire_punched(&self, dnode: &Dnode, txg: Txg, punched: Vec<(u64, BlockPointer, BlockPointer)>) {
        if punched.is_empty() {
            return;
        }
        debug!(
            target: "dbc::sync",
            object = dnode.object().0,
            txg = txg.0,
            blocks = punched.len(),
            "sync_punch_holes"
        );
        for (blkid, old, hole) in punched {
            self.store.free_block(txg, &old);
            dnode.diduse_space(-psize_i64(&old));
            let id = BufIdentity::new(dnode.objset(), dnode.object(), 0, BlkId(blkid));
            // A child re-dirtied in a later txg still points at `old`; its
            // next sync must replace the hole, not free `old` again.
            self.hash.find_map(&self.arena, &id, &self.stats, |_, child| {
                if child.bp.is_none_or(|bp| bp.address == old.address) {
                    child.bp = Some(hole);
                }
            });
        }
    }
}
