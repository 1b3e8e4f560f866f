//! Read pipeline: bring a buffer from `Uncached` to `Cached`.
//!
//! Holes, freed blocks and bonus buffers are materialized without I/O.
//! Everything else is fetched through the block store; the buffer carries
//! an extra hold while the read is in flight, and every thread waiting on
//! it is woken by the completion.
//!
//! # Logging
//!
//! - **TRACE** `dbc::read` `read_hole_fill`: content synthesized without I/O
//! - **TRACE** `dbc::read` `read_issue`: block read handed to the store
//! - **DEBUG** `dbc::read` `read_failed_prefetch`: a speculative read failed
//! - **ERROR** `dbc::read` `read_failed`: a demand read failed

use crate::cache::CacheShared;
use crate::dbuf::{Dbuf, DbufInner, DbufState};
use crate::stats::bump;
use crate::parse_to_dbc_error;
use dbc_block::{BlockBuf, IoPriority, ReadFlags};
use dbc_error::{DbcError, Result};
use dbc_types::{BLKPTR_SIZE, BlockPointer, Txg};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, error, trace};

impl CacheShared {
    /// Read `db` unless it is already cached, waiting for in-flight reads
    /// and fills unless `NEVER_WAIT` is set.
    pub(crate) fn read(self: &Arc<Self>, db: &Arc<Dbuf>, flags: ReadFlags) -> Result<()> {
        self.read_at(db, flags, None)
    }

    /// [`read`](Self::read) with an explicit I/O priority; `None` derives
    /// it from `flags`.
    pub(crate) fn read_at(
        self: &Arc<Self>,
        db: &Arc<Dbuf>,
        flags: ReadFlags,
        priority: Option<IoPriority>,
    ) -> Result<()> {
        let mut inner = db.inner.lock();
        assert!(inner.holds > 0, "read of unheld buffer {}", db.id);
        let mut issued = false;
        let mut waited = false;
        loop {
            match inner.state {
                DbufState::Cached => return Ok(()),
                DbufState::NoFill => {
                    return Err(DbcError::ReadFailed {
                        block: 0,
                        detail: format!("{} was dirtied without content", db.id),
                    });
                }
                DbufState::Evicting => panic!("read of evicting buffer {}", db.id),
                DbufState::Read { .. } | DbufState::Fill { .. } => {
                    if flags.contains(ReadFlags::NEVER_WAIT) {
                        return if issued { Ok(()) } else { Err(DbcError::Incomplete) };
                    }
                    db.changed.wait(&mut inner);
                    waited = true;
                }
                DbufState::Uncached => {
                    if issued || waited {
                        if let Some(err) = &inner.last_error {
                            return Err(err.clone());
                        }
                    }
                    inner = self.start_read(db, inner, flags, priority)?;
                    issued = true;
                }
            }
        }
    }

    fn start_read<'a>(
        self: &Arc<Self>,
        db: &'a Arc<Dbuf>,
        mut inner: MutexGuard<'a, DbufInner>,
        flags: ReadFlags,
        priority: Option<IoPriority>,
    ) -> Result<MutexGuard<'a, DbufInner>> {
        if db.id.is_bonus() {
            let mut bonus = db.dnode.phys.read().bonus.clone();
            bonus.resize(db.size(), 0);
            inner.data = Some(BlockBuf::new(bonus));
            return Ok(self.finish_local_fill(db, inner));
        }

        let freed = if db.id.is_spill() {
            db.dnode.is_spill_removed()
        } else {
            db.id.level == 0 && !db.id.blkid.is_special() && db.dnode.is_block_freed(db.id.blkid)
        };
        let bp = match inner.bp {
            Some(bp) if !bp.is_hole() && !freed => bp,
            bp => {
                let hole = if freed { None } else { bp };
                inner.data = Some(self.hole_content(db, hole.as_ref()));
                bump(&self.stats.hole_fills);
                trace!(target: "dbc::read", id = %db.id, freed, "read_hole_fill");
                return Ok(self.finish_local_fill(db, inner));
            }
        };

        if bp.is_redacted() {
            if !self.tunables.load().allow_redacted_reads {
                return Err(DbcError::Redacted);
            }
            inner.data = Some(BlockBuf::zeroed(db.size()));
            return Ok(self.finish_local_fill(db, inner));
        }
        if bp.is_encrypted() && !db.dnode.key_loaded() && !flags.contains(ReadFlags::NO_DECRYPT) {
            return Err(DbcError::KeyUnavailable);
        }

        inner.state = DbufState::Read { freed: false };
        inner.holds += 1;
        inner.last_error = None;
        drop(inner);

        bump(&self.stats.reads);
        let priority = priority.unwrap_or(if flags.contains(ReadFlags::PREFETCH) {
            IoPriority::AsyncRead
        } else {
            IoPriority::SyncRead
        });
        trace!(target: "dbc::read", id = %db.id, address = bp.address, ?priority, "read_issue");
        let shared = Arc::clone(self);
        let target = Arc::clone(db);
        self.store.read_block(
            &bp,
            priority,
            flags,
            Box::new(move |result| shared.read_done(&target, bp.address, result, flags)),
        );
        Ok(db.inner.lock())
    }

    fn finish_local_fill<'a>(
        &self,
        db: &Dbuf,
        mut inner: MutexGuard<'a, DbufInner>,
    ) -> MutexGuard<'a, DbufInner> {
        inner.state = DbufState::Cached;
        inner.last_error = None;
        db.changed.notify_all();
        inner
    }

    /// Zeroed content for a hole. An indirect hole with a birth txg gets
    /// child holes carrying the same birth, so the freed subtree still
    /// records when it was punched.
    pub(crate) fn hole_content(&self, db: &Dbuf, bp: Option<&BlockPointer>) -> BlockBuf {
        let mut content = vec![0_u8; db.size()];
        if let Some(bp) = bp.filter(|bp| db.id.level > 0 && bp.birth != Txg::ZERO) {
            let child_lsize = if db.id.level == 1 {
                db.dnode.data_block_size()
            } else {
                db.dnode.indirect_block_size()
            };
            let child = BlockPointer::hole(child_lsize, bp.object_type, db.id.level - 1, bp.birth);
            for slot in 0..db.size() / BLKPTR_SIZE {
                if child.encode_slot(&mut content, slot).is_err() {
                    break;
                }
            }
        }
        BlockBuf::new(content)
    }

    fn read_done(&self, db: &Arc<Dbuf>, address: u64, result: Result<BlockBuf>, flags: ReadFlags) {
        let mut inner = db.inner.lock();
        let freed = match inner.state {
            DbufState::Read { freed } => freed,
            state => panic!("read completion for {} in state {state:?}", db.id),
        };

        let outcome = if freed {
            Ok(BlockBuf::zeroed(db.size()))
        } else {
            result.and_then(|buf| {
                if buf.len() == db.size() {
                    Ok(buf)
                } else {
                    Err(DbcError::Corruption {
                        block: address,
                        detail: format!("read {} bytes, expected {}", buf.len(), db.size()),
                    })
                }
            })
        };

        match outcome {
            Ok(buf) => {
                inner.data = Some(buf);
                inner.state = DbufState::Cached;
            }
            Err(err) => {
                bump(&self.stats.read_errors);
                if flags.contains(ReadFlags::PREFETCH) {
                    debug!(target: "dbc::read", id = %db.id, address, error = %err, "read_failed_prefetch");
                } else {
                    error!(target: "dbc::read", id = %db.id, address, error = %err, "read_failed");
                }
                inner.data = None;
                inner.state = DbufState::Uncached;
                inner.last_error = Some(err);
            }
        }
        db.changed.notify_all();
        drop(inner);
        self.rele(db);
    }

    /// Decode child slot `slot` of indirect buffer `db`, which must be
    /// cached.
    pub(crate) fn child_blkptr(&self, db: &Dbuf, slot: usize) -> Result<BlockPointer> {
        let _bp_guard = db.bp_lock.read();
        let inner = db.inner.lock();
        let data = inner.data.as_ref().ok_or_else(|| DbcError::ReadFailed {
            block: inner.bp.map_or(0, |bp| bp.address),
            detail: format!("indirect {} has no content", db.id),
        })?;
        BlockPointer::decode_slot(data.as_slice(), slot).map_err(|e| {
            parse_to_dbc_error(&e, inner.bp.map_or(0, |bp| bp.address))
        })
    }
}
