//! Object descriptors.
//!
//! A [`Dnode`] carries the block geometry of one object (data block size,
//! indirect block shift, tree height), its root block pointers, bonus and
//! spill content, and the per-txg bookkeeping the cache needs: top-level
//! dirty records, freed block ranges and the set of cached buffers.
//!
//! Lock order: buffer → dnode state. No dnode lock is held while a buffer
//! lock is acquired.

use crate::arena::DbufIndex;
use crate::dbuf::Dbuf;
use crate::dirty::DirtyRecord;
use dbc_block::WritePolicy;
use dbc_error::{DbcError, Result};
use dbc_types::{
    BLKPTR_SHIFT, BlkId, BlockPointer, MAX_BLOCK_SHIFT, MIN_BLOCK_SHIFT, ObjectId, ObjectType,
    ObjsetId, Txg,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

/// Deepest supported block tree.
pub const MAX_LEVELS: u8 = 8;
/// Most root block pointers an object can carry.
pub const MAX_NBLKPTR: usize = 3;

/// Which of an object's buffers may stay cached once unheld.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    #[default]
    All,
    /// Only indirect blocks and blocks of metadata types.
    Metadata,
    None,
}

impl CachePolicy {
    fn to_u8(self) -> u8 {
        match self {
            Self::All => 0,
            Self::Metadata => 1,
            Self::None => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::All,
            1 => Self::Metadata,
            _ => Self::None,
        }
    }
}

/// Geometry and type of a new object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnodeLayout {
    pub object_type: ObjectType,
    pub data_block_size: u32,
    pub indirect_block_shift: u8,
    pub nlevels: u8,
    pub nblkptr: usize,
    pub bonus_len: usize,
    pub encrypted: bool,
}

impl Default for DnodeLayout {
    fn default() -> Self {
        Self {
            object_type: ObjectType::PlainFileContents,
            data_block_size: 128 * 1024,
            indirect_block_shift: 17,
            nlevels: 1,
            nblkptr: 1,
            bonus_len: 192,
            encrypted: false,
        }
    }
}

impl DnodeLayout {
    pub fn validate(&self) -> Result<()> {
        let min = 1_u32 << MIN_BLOCK_SHIFT;
        let max = 1_u32 << MAX_BLOCK_SHIFT;
        if self.data_block_size < min
            || self.data_block_size > max
            || self.data_block_size % min != 0
        {
            return Err(DbcError::Format(format!(
                "data block size {} outside [{min}, {max}] or not a multiple of {min}",
                self.data_block_size
            )));
        }
        if self.indirect_block_shift <= BLKPTR_SHIFT
            || self.indirect_block_shift < MIN_BLOCK_SHIFT
            || self.indirect_block_shift > MAX_BLOCK_SHIFT
        {
            return Err(DbcError::Format(format!(
                "indirect block shift {} out of range",
                self.indirect_block_shift
            )));
        }
        if self.nlevels == 0 || self.nlevels > MAX_LEVELS {
            return Err(DbcError::Format(format!("nlevels {} out of range", self.nlevels)));
        }
        if self.nblkptr == 0 || self.nblkptr > MAX_NBLKPTR {
            return Err(DbcError::Format(format!("nblkptr {} out of range", self.nblkptr)));
        }
        Ok(())
    }
}

/// On-disk shaped state, guarded by the dnode's struct lock.
pub(crate) struct DnodePhys {
    pub nlevels: u8,
    pub maxblkid: u64,
    pub blkptr: Vec<BlockPointer>,
    pub bonus: Vec<u8>,
    pub spill: BlockPointer,
}

/// Inclusive block ranges freed in one txg.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FreedRanges {
    ranges: BTreeMap<u64, u64>,
}

impl FreedRanges {
    pub fn add(&mut self, start: u64, end: u64) {
        let (mut start, mut end) = (start, end);
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e.saturating_add(1) >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
            }
        }
        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(start..)
            .take_while(|(s, _)| **s <= end.saturating_add(1))
            .map(|(s, e)| (*s, *e))
            .collect();
        for (s, e) in absorbed {
            self.ranges.remove(&s);
            end = end.max(e);
        }
        self.ranges.insert(start, end);
    }

    pub fn remove(&mut self, blkid: u64) {
        let Some((&s, &e)) = self.ranges.range(..=blkid).next_back() else {
            return;
        };
        if e < blkid {
            return;
        }
        self.ranges.remove(&s);
        if s < blkid {
            self.ranges.insert(s, blkid - 1);
        }
        if blkid < e {
            self.ranges.insert(blkid + 1, e);
        }
    }

    pub fn contains(&self, blkid: u64) -> bool {
        self.ranges
            .range(..=blkid)
            .next_back()
            .is_some_and(|(_, e)| *e >= blkid)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[derive(Default)]
pub(crate) struct DnodeDirty {
    /// Records whose parent is the dnode itself: top-level blocks, bonus
    /// and spill.
    pub records: BTreeMap<Txg, Vec<Arc<DirtyRecord>>>,
    pub freed: BTreeMap<Txg, FreedRanges>,
    /// Txgs whose sync drops the spill block.
    pub spill_removed: BTreeSet<Txg>,
    pub txgs: BTreeSet<Txg>,
}

/// One object's descriptor.
pub struct Dnode {
    objset: ObjsetId,
    object: ObjectId,
    object_type: ObjectType,
    datablksz: u32,
    indblkshift: u8,
    bonus_len: usize,
    encrypted: bool,
    pub(crate) phys: RwLock<DnodePhys>,
    pub(crate) dirty: Mutex<DnodeDirty>,
    pub(crate) dbufs: Mutex<BTreeMap<(u8, u64), DbufIndex>>,
    pub(crate) bonus_dbuf: Mutex<Option<Arc<Dbuf>>>,
    policy: AtomicU8,
    key_loaded: AtomicBool,
    used_bytes: AtomicI64,
}

impl std::fmt::Debug for Dnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dnode")
            .field("objset", &self.objset)
            .field("object", &self.object)
            .field("type", &self.object_type)
            .field("datablksz", &self.datablksz)
            .finish_non_exhaustive()
    }
}

impl Dnode {
    pub fn new(objset: ObjsetId, object: ObjectId, layout: &DnodeLayout) -> Result<Arc<Self>> {
        layout.validate()?;
        let top = layout.nlevels - 1;
        let root_lsize = if top == 0 {
            layout.data_block_size
        } else {
            1_u32 << layout.indirect_block_shift
        };
        let blkptr = vec![
            BlockPointer::hole(root_lsize, layout.object_type, top, Txg::ZERO);
            layout.nblkptr
        ];
        Ok(Arc::new(Self {
            objset,
            object,
            object_type: layout.object_type,
            datablksz: layout.data_block_size,
            indblkshift: layout.indirect_block_shift,
            bonus_len: layout.bonus_len,
            encrypted: layout.encrypted,
            phys: RwLock::new(DnodePhys {
                nlevels: layout.nlevels,
                maxblkid: 0,
                blkptr,
                bonus: vec![0; layout.bonus_len],
                spill: BlockPointer::hole(layout.data_block_size, layout.object_type, 0, Txg::ZERO),
            }),
            dirty: Mutex::new(DnodeDirty::default()),
            dbufs: Mutex::new(BTreeMap::new()),
            bonus_dbuf: Mutex::new(None),
            policy: AtomicU8::new(CachePolicy::All.to_u8()),
            key_loaded: AtomicBool::new(!layout.encrypted),
            used_bytes: AtomicI64::new(0),
        }))
    }

    #[must_use]
    pub fn objset(&self) -> ObjsetId {
        self.objset
    }

    #[must_use]
    pub fn object(&self) -> ObjectId {
        self.object
    }

    #[must_use]
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    #[must_use]
    pub fn data_block_size(&self) -> u32 {
        self.datablksz
    }

    #[must_use]
    pub fn indirect_block_size(&self) -> u32 {
        1_u32 << self.indblkshift
    }

    /// log2 of block pointers per indirect block.
    #[must_use]
    pub fn epbs(&self) -> u32 {
        u32::from(self.indblkshift - BLKPTR_SHIFT)
    }

    #[must_use]
    pub fn nlevels(&self) -> u8 {
        self.phys.read().nlevels
    }

    #[must_use]
    pub fn max_blkid(&self) -> u64 {
        self.phys.read().maxblkid
    }

    /// Declare the highest allocated level-0 block of an existing object.
    pub fn set_max_blkid(&self, maxblkid: u64) {
        self.phys.write().maxblkid = maxblkid;
    }

    #[must_use]
    pub fn root_blkptr(&self, index: usize) -> Option<BlockPointer> {
        self.phys.read().blkptr.get(index).copied()
    }

    /// Install a root block pointer of an existing object.
    pub fn set_root_blkptr(&self, index: usize, bp: BlockPointer) -> Result<()> {
        let mut phys = self.phys.write();
        let slot = phys
            .blkptr
            .get_mut(index)
            .ok_or_else(|| DbcError::Format(format!("root slot {index} out of range")))?;
        *slot = bp;
        Ok(())
    }

    #[must_use]
    pub fn spill_blkptr(&self) -> BlockPointer {
        self.phys.read().spill
    }

    pub fn set_spill_blkptr(&self, bp: BlockPointer) {
        self.phys.write().spill = bp;
    }

    /// Committed bonus content.
    #[must_use]
    pub fn bonus_bytes(&self) -> Vec<u8> {
        self.phys.read().bonus.clone()
    }

    #[must_use]
    pub fn bonus_len(&self) -> usize {
        self.bonus_len
    }

    #[must_use]
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy::from_u8(self.policy.load(Ordering::Relaxed))
    }

    pub fn set_cache_policy(&self, policy: CachePolicy) {
        self.policy.store(policy.to_u8(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    #[must_use]
    pub fn key_loaded(&self) -> bool {
        self.key_loaded.load(Ordering::Acquire)
    }

    pub fn set_key_loaded(&self, loaded: bool) {
        self.key_loaded.store(loaded, Ordering::Release);
    }

    /// Net allocated bytes charged to this object by completed writes.
    #[must_use]
    pub fn used_bytes(&self) -> i64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Whether `blkid` lies in a range freed by a txg that has not synced.
    #[must_use]
    pub fn is_block_freed(&self, blkid: BlkId) -> bool {
        self.dirty.lock().freed.values().any(|r| r.contains(blkid.0))
    }

    /// Number of buffers of this object currently in the identity table,
    /// excluding the bonus buffer.
    #[must_use]
    pub fn cached_buffer_count(&self) -> usize {
        self.dbufs.lock().len()
    }

    // ── Crate-internal geometry ─────────────────────────────────────────

    pub(crate) fn block_size(&self, level: u8, blkid: BlkId) -> usize {
        if blkid == BlkId::BONUS {
            return self.bonus_len;
        }
        let bytes = if blkid == BlkId::SPILL {
            self.phys.read().spill.lsize
        } else if level == 0 {
            self.datablksz
        } else {
            self.indirect_block_size()
        };
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }

    /// How many blocks at `level` the tree can address.
    pub(crate) fn capacity(&self, level: u8) -> u64 {
        let phys = self.phys.read();
        if level >= phys.nlevels {
            return 0;
        }
        let shift = self.epbs() * u32::from(phys.nlevels - 1 - level);
        let roots = u64::try_from(phys.blkptr.len()).unwrap_or(u64::MAX);
        roots.checked_shl(shift).filter(|v| v >> shift == roots).unwrap_or(u64::MAX)
    }

    pub(crate) fn child_slot(&self, blkid: u64) -> usize {
        let mask = (1_u64 << self.epbs()) - 1;
        usize::try_from(blkid & mask).unwrap_or(0)
    }

    pub(crate) fn write_policy(&self, level: u8) -> WritePolicy {
        WritePolicy {
            object_type: self.object_type,
            level,
            compress: true,
            encrypt: self.encrypted,
            copies: 1,
        }
    }

    /// Raise `maxblkid` to cover `blkid`.
    pub(crate) fn new_blkid(&self, blkid: u64) {
        let mut phys = self.phys.write();
        if blkid > phys.maxblkid {
            phys.maxblkid = blkid;
        }
    }

    pub(crate) fn diduse_space(&self, delta: i64) {
        self.used_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    // ── Crate-internal dirty bookkeeping ────────────────────────────────

    /// Mark dirty in `txg`; true when this is the first mark for `txg`.
    pub(crate) fn note_dirty(&self, txg: Txg) -> bool {
        self.dirty.lock().txgs.insert(txg)
    }

    pub(crate) fn add_top_level(&self, txg: Txg, dr: Arc<DirtyRecord>) {
        self.dirty.lock().records.entry(txg).or_default().push(dr);
    }

    pub(crate) fn remove_top_level(&self, txg: Txg, dr: &Arc<DirtyRecord>) {
        let mut dirty = self.dirty.lock();
        if let Some(list) = dirty.records.get_mut(&txg) {
            list.retain(|r| !Arc::ptr_eq(r, dr));
        }
    }

    pub(crate) fn take_top_level(&self, txg: Txg) -> Vec<Arc<DirtyRecord>> {
        self.dirty.lock().records.remove(&txg).unwrap_or_default()
    }

    pub(crate) fn record_freed(&self, txg: Txg, start: u64, end: u64) {
        self.dirty.lock().freed.entry(txg).or_default().add(start, end);
    }

    /// A block dirtied in `txg` is no longer freed there.
    pub(crate) fn clear_freed(&self, txg: Txg, blkid: u64) {
        let mut dirty = self.dirty.lock();
        if let Some(ranges) = dirty.freed.get_mut(&txg) {
            ranges.remove(blkid);
            if ranges.is_empty() {
                dirty.freed.remove(&txg);
            }
        }
    }

    pub(crate) fn record_spill_removed(&self, txg: Txg) {
        self.dirty.lock().spill_removed.insert(txg);
    }

    /// A spill dirtied in `txg` survives that txg's sync.
    pub(crate) fn keep_spill(&self, txg: Txg) {
        self.dirty.lock().spill_removed.remove(&txg);
    }

    pub(crate) fn take_spill_removed(&self, txg: Txg) -> bool {
        self.dirty.lock().spill_removed.remove(&txg)
    }

    /// Whether a txg that has not synced drops the spill block.
    pub(crate) fn is_spill_removed(&self) -> bool {
        !self.dirty.lock().spill_removed.is_empty()
    }

    /// Drop all per-txg bookkeeping once `txg` has synced.
    pub(crate) fn retire_txg(&self, txg: Txg) {
        let mut dirty = self.dirty.lock();
        dirty.freed.remove(&txg);
        dirty.spill_removed.remove(&txg);
        dirty.txgs.remove(&txg);
    }

    // ── Crate-internal buffer registry ──────────────────────────────────

    pub(crate) fn register_dbuf(&self, level: u8, blkid: BlkId, index: DbufIndex) {
        self.dbufs.lock().insert((level, blkid.0), index);
    }

    pub(crate) fn forget_dbuf(&self, level: u8, blkid: BlkId, index: DbufIndex) {
        let mut dbufs = self.dbufs.lock();
        if dbufs.get(&(level, blkid.0)) == Some(&index) {
            dbufs.remove(&(level, blkid.0));
        }
    }

    pub(crate) fn dbufs_in(&self, level: u8, start: u64, end: u64) -> Vec<DbufIndex> {
        self.dbufs
            .lock()
            .range((level, start)..=(level, end))
            .map(|(_, idx)| *idx)
            .collect()
    }

    /// Registered buffers, lowest level first.
    pub(crate) fn all_dbufs(&self) -> Vec<DbufIndex> {
        self.dbufs.lock().values().copied().collect()
    }
}
