//! The cached buffer and the hold handle through which callers use it.
//!
//! Every mutable field of a buffer lives in [`DbufInner`] behind the
//! buffer's mutex; the condvar `changed` is signalled whenever the state or
//! an override settles. `bp_lock` guards the block pointers stored in this
//! buffer's content when it is an indirect block.

use crate::arena::DbufIndex;
use crate::cache::CacheShared;
use crate::dirty::DirtyRecord;
use crate::dnode::Dnode;
use crate::evict::CacheTier;
use dbc_block::{BlockBuf, ReadFlags};
use dbc_error::{DbcError, Result};
use dbc_types::{BlockPointer, BufIdentity, Txg};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Content lifecycle of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbufState {
    /// No content.
    Uncached,
    /// A read is in flight. `freed` is set if the block was freed meanwhile;
    /// the completion then discards what it read and zero-fills.
    Read { freed: bool },
    /// A writer is filling the whole block. `freed` as for `Read`.
    Fill { freed: bool },
    Cached,
    /// Dirtied with the promise the content will never be read or written.
    NoFill,
    /// Being destroyed; invisible to lookups.
    Evicting,
}

impl DbufState {
    pub(crate) fn is_busy(self) -> bool {
        matches!(self, Self::Read { .. } | Self::Fill { .. })
    }
}

/// Caller state attached to a level-0 buffer.
///
/// `evict` runs once, without any cache lock held, when the buffer is
/// destroyed or, for users attached with
/// [`DbufHold::set_user_immediate`], when the last non-dirty hold goes.
pub trait DbufUser: Send + Sync {
    fn evict(&self);
}

pub type UserRef = Arc<dyn DbufUser>;

fn same_user(a: Option<&UserRef>, b: Option<&UserRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

pub(crate) struct DbufInner {
    pub state: DbufState,
    pub data: Option<BlockBuf>,
    /// `None` until resolved; holes are `Some` with address 0.
    pub bp: Option<BlockPointer>,
    pub parent: Option<DbufIndex>,
    pub holds: u64,
    /// Newest first; at most one per open txg.
    pub dirty: Vec<Arc<DirtyRecord>>,
    /// The record whose write is in flight.
    pub data_pending: Option<Arc<DirtyRecord>>,
    pub tier: CacheTier,
    pub tier_seq: u64,
    pub pending_evict: bool,
    pub last_error: Option<DbcError>,
    pub user: Option<UserRef>,
    pub immediate_evict: bool,
}

impl DbufInner {
    pub fn dirty_count(&self) -> u64 {
        u64::try_from(self.dirty.len()).unwrap_or(u64::MAX)
    }

    pub fn record_for(&self, txg: Txg) -> Option<&Arc<DirtyRecord>> {
        self.dirty.iter().find(|dr| dr.txg() == txg)
    }
}

pub(crate) struct Dbuf {
    pub id: BufIdentity,
    pub index: DbufIndex,
    pub dnode: Arc<Dnode>,
    /// Changes only under the buffer lock, while the buffer is held.
    size: AtomicUsize,
    pub inner: Mutex<DbufInner>,
    pub changed: Condvar,
    pub bp_lock: RwLock<()>,
    evicting: AtomicBool,
}

impl Dbuf {
    pub fn new(
        id: BufIdentity,
        index: DbufIndex,
        dnode: Arc<Dnode>,
        bp: Option<BlockPointer>,
        parent: Option<DbufIndex>,
    ) -> Self {
        let size = dnode.block_size(id.level, id.blkid);
        Self {
            id,
            index,
            dnode,
            size: AtomicUsize::new(size),
            inner: Mutex::new(DbufInner {
                state: DbufState::Uncached,
                data: None,
                bp,
                parent,
                holds: 1,
                dirty: Vec::new(),
                data_pending: None,
                tier: CacheTier::None,
                tier_seq: 0,
                pending_evict: false,
                last_error: None,
                user: None,
                immediate_evict: false,
            }),
            changed: Condvar::new(),
            bp_lock: RwLock::new(()),
            evicting: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }

    /// Lock-free mirror of `state == Evicting`.
    pub fn is_evicting(&self) -> bool {
        self.evicting.load(Ordering::Acquire)
    }

    /// Caller holds the buffer lock and has just set `Evicting`.
    pub fn mark_evicting(&self) {
        self.evicting.store(true, Ordering::Release);
    }
}

/// A counted reference to a cached buffer.
///
/// While any hold exists the buffer cannot be evicted. Dropping the hold
/// releases it; the last release either parks the buffer in a cache tier or
/// destroys it.
pub struct DbufHold {
    cache: Arc<CacheShared>,
    db: Arc<Dbuf>,
    release_on_drop: bool,
}

impl DbufHold {
    /// Wrap a hold the caller has already counted.
    pub(crate) fn new(cache: Arc<CacheShared>, db: Arc<Dbuf>) -> Self {
        Self {
            cache,
            db,
            release_on_drop: true,
        }
    }

    pub(crate) fn dbuf(&self) -> &Arc<Dbuf> {
        &self.db
    }

    /// Hand the counted hold to a child buffer's parent link.
    pub(crate) fn transfer(mut self) -> DbufIndex {
        self.release_on_drop = false;
        self.db.index
    }

    #[must_use]
    pub fn identity(&self) -> BufIdentity {
        self.db.id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.db.size()
    }

    #[must_use]
    pub fn state(&self) -> DbufState {
        self.db.inner.lock().state
    }

    /// The block pointer this buffer was read from or last written to.
    #[must_use]
    pub fn blkptr(&self) -> Option<BlockPointer> {
        self.db.inner.lock().bp
    }

    /// All holds on the buffer, including dirty and I/O holds.
    #[must_use]
    pub fn hold_count(&self) -> u64 {
        self.db.inner.lock().holds
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.db.inner.lock().dirty.len()
    }

    #[must_use]
    pub fn dirty_record(&self, txg: Txg) -> Option<Arc<DirtyRecord>> {
        self.db.inner.lock().record_for(txg).cloned()
    }

    /// Live content without triggering a read.
    #[must_use]
    pub fn content(&self) -> Option<BlockBuf> {
        self.db.inner.lock().data.clone()
    }

    /// Bring the buffer to `Cached`.
    pub fn read(&self, flags: ReadFlags) -> Result<()> {
        self.cache.read(&self.db, flags)
    }

    /// Read, then return the live content.
    pub fn data(&self, flags: ReadFlags) -> Result<BlockBuf> {
        self.cache.read(&self.db, flags)?;
        self.db
            .inner
            .lock()
            .data
            .clone()
            .ok_or_else(|| DbcError::ReadFailed {
                block: 0,
                detail: format!("{} has no content after read", self.db.id),
            })
    }

    /// Record an intent to modify in `txg`. Idempotent per txg.
    pub fn dirty(&self, txg: Txg) -> Result<Arc<DirtyRecord>> {
        self.cache.dirty(&self.db, txg)
    }

    /// Read current content, then dirty.
    pub fn will_dirty(&self, txg: Txg) -> Result<Arc<DirtyRecord>> {
        self.cache.will_dirty(&self.db, txg)
    }

    /// Announce that the caller will overwrite the whole block in `txg`.
    pub fn will_fill(&self, txg: Txg) -> Result<()> {
        self.cache.will_fill(&self.db, txg)
    }

    pub fn fill_done(&self) {
        self.cache.fill_done(&self.db);
    }

    /// Dirty without ever materializing content.
    pub fn will_not_fill(&self, txg: Txg) -> Result<()> {
        self.cache.will_not_fill(&self.db, txg)
    }

    /// Copy `bytes` into the block at `offset` as part of `txg`.
    pub fn write_at(&self, txg: Txg, offset: usize, bytes: &[u8]) -> Result<()> {
        self.cache.write_at(&self.db, txg, offset, bytes)
    }

    /// Dirty for `txg` and edit the live content in place.
    pub fn modify<R>(&self, txg: Txg, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.cache.modify(&self.db, txg, f)
    }

    /// Replace the content with a caller-supplied block for `txg`.
    pub fn assign_content(&self, buf: BlockBuf, txg: Txg) -> Result<()> {
        self.cache.assign_content(&self.db, buf, txg)
    }

    /// Take the content out of the buffer for exclusive use.
    pub fn loan_content(&self) -> Result<BlockBuf> {
        self.cache.loan_content(&self.db)
    }

    /// The content that will be written for `txg`.
    #[must_use]
    pub fn pending_content(&self, txg: Txg) -> Option<BlockBuf> {
        self.cache.pending_content(&self.db, txg)
    }

    /// Start an out-of-band write of the `txg` content.
    pub fn begin_override(&self, txg: Txg) -> Result<BlockBuf> {
        self.cache.begin_override(&self.db, txg)
    }

    /// Finish an out-of-band write; sync will adopt `bp`.
    pub fn complete_override(&self, txg: Txg, bp: BlockPointer) -> Result<()> {
        self.cache.settle_override(&self.db, txg, Some(bp))
    }

    pub fn abort_override(&self, txg: Txg) -> Result<()> {
        self.cache.settle_override(&self.db, txg, None)
    }

    /// Resize the spill block as part of `txg`; other blocks are refused.
    pub fn resize(&self, size: usize, txg: Txg) -> Result<()> {
        self.cache.resize(&self.db, size, txg)
    }

    /// Attach `user` unless one is already attached. Returns the existing
    /// user in that case.
    pub fn set_user(&self, user: UserRef) -> Option<UserRef> {
        self.update_user(None, Some(user)).err().flatten()
    }

    /// As [`set_user`](Self::set_user), but the user is evicted as soon as
    /// only dirty holds remain.
    pub fn set_user_immediate(&self, user: UserRef) -> Option<UserRef> {
        self.db.inner.lock().immediate_evict = true;
        self.set_user(user)
    }

    /// Swap the attached user for `user` if `expected` is still attached.
    /// On a mismatch nothing changes and the attached user is returned.
    pub fn update_user(
        &self,
        expected: Option<&UserRef>,
        user: Option<UserRef>,
    ) -> std::result::Result<Option<UserRef>, Option<UserRef>> {
        assert_eq!(self.db.id.level, 0, "user attached to indirect {}", self.db.id);
        let mut inner = self.db.inner.lock();
        if same_user(inner.user.as_ref(), expected) {
            Ok(std::mem::replace(&mut inner.user, user))
        } else {
            Err(inner.user.clone())
        }
    }

    #[must_use]
    pub fn user(&self) -> Option<UserRef> {
        self.db.inner.lock().user.clone()
    }
}

impl Clone for DbufHold {
    fn clone(&self) -> Self {
        self.db.inner.lock().holds += 1;
        Self::new(Arc::clone(&self.cache), Arc::clone(&self.db))
    }
}

impl Drop for DbufHold {
    fn drop(&mut self) {
        if self.release_on_drop {
            self.cache.rele(&self.db);
        }
    }
}

impl std::fmt::Debug for DbufHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbufHold")
            .field("identity", &self.db.id)
            .finish_non_exhaustive()
    }
}
