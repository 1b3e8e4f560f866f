//! Best-effort prefetch.
//!
//! Starting from the nearest resident ancestor (or the object's root
//! pointers), each step reads one indirect block and decodes the child
//! pointer leading to the target. The last step creates the target buffer
//! and starts its read; nobody waits on it. Any failure ends the chain.
//!
//! # Logging
//!
//! - **TRACE** `dbc::prefetch` `prefetch_start`: chain started
//! - **DEBUG** `dbc::prefetch` `prefetch_abandoned`: a step failed

use crate::cache::CacheShared;
use crate::dbuf::DbufState;
use crate::dnode::Dnode;
use crate::stats::bump;
use dbc_block::{IoPriority, ReadFlags};
use dbc_types::{BlkId, BlockPointer, BufIdentity};
use std::sync::Arc;
use tracing::{debug, trace};

/// Position of one step in the walk down to the target.
#[derive(Debug, Clone, Copy)]
struct Step {
    level: u8,
    blkid: u64,
}

impl CacheShared {
    pub(crate) fn prefetch(
        self: &Arc<Self>,
        dnode: &Arc<Dnode>,
        level: u8,
        blkid: BlkId,
        priority: IoPriority,
    ) -> bool {
        if blkid.is_special() {
            return false;
        }
        let epbs = dnode.epbs();
        let (nlevels, maxblkid) = {
            let phys = dnode.phys.read();
            (phys.nlevels, phys.maxblkid)
        };
        if level >= nlevels {
            return false;
        }
        if blkid.0 > maxblkid.checked_shr(u32::from(level) * epbs).unwrap_or(0) {
            return false;
        }
        if level == 0 && dnode.is_block_freed(blkid) {
            return false;
        }
        let id = BufIdentity::new(dnode.objset(), dnode.object(), level, blkid);
        if self.hash.contains(&self.arena, &id) {
            return false;
        }

        let Some((from, bp)) = self.resident_ancestor(dnode, level, blkid.0) else {
            return false;
        };
        if bp.is_hole() {
            return false;
        }

        bump(&self.stats.prefetches);
        trace!(target: "dbc::prefetch", %id, from_level = from.level, "prefetch_start");
        self.prefetch_step(Arc::clone(dnode), Step { level, blkid: blkid.0 }, from, bp, priority);
        true
    }

    /// Walk up from the target until a cached indirect block or the root
    /// pointers give a block pointer. Returns the step that pointer
    /// describes.
    fn resident_ancestor(&self, dnode: &Dnode, level: u8, blkid: u64) -> Option<(Step, BlockPointer)> {
        let nlevels = dnode.nlevels();
        let epbs = dnode.epbs();
        let mut cur = Step { level, blkid };
        loop {
            if cur.level + 1 >= nlevels {
                let index = usize::try_from(cur.blkid).ok()?;
                return dnode.root_blkptr(index).map(|bp| (cur, bp));
            }
            let parent = Step {
                level: cur.level + 1,
                blkid: cur.blkid >> epbs,
            };
            let parent_id = BufIdentity::new(dnode.objset(), dnode.object(), parent.level, BlkId(parent.blkid));
            let slot = dnode.child_slot(cur.blkid);
            let decoded = self
                .hash
                .find_map(&self.arena, &parent_id, &self.stats, |_, inner| {
                    if inner.state != DbufState::Cached {
                        return None;
                    }
                    inner
                        .data
                        .as_ref()
                        .map(|data| BlockPointer::decode_slot(data.as_slice(), slot))
                })
                .flatten();
            match decoded {
                Some(Ok(bp)) => return Some((cur, bp)),
                Some(Err(_)) => return None,
                None => cur = parent,
            }
        }
    }

    fn prefetch_step(
        self: &Arc<Self>,
        dnode: Arc<Dnode>,
        target: Step,
        at: Step,
        bp: BlockPointer,
        priority: IoPriority,
    ) {
        if at.level == target.level {
            let hold = self.create(&dnode, target.level, BlkId(target.blkid), None, Some(bp));
            let flags = ReadFlags::NEVER_WAIT | ReadFlags::PREFETCH;
            if let Err(err) = self.read_at(hold.dbuf(), flags, Some(priority)) {
                debug!(target: "dbc::prefetch", id = %hold.identity(), error = %err, "prefetch_abandoned");
            }
            return;
        }

        let shared = Arc::clone(self);
        let epbs = dnode.epbs();
        self.store.read_block(
            &bp,
            priority,
            ReadFlags::PREFETCH | ReadFlags::CAN_FAIL,
            Box::new(move |result| {
                let next_level = at.level - 1;
                let next = Step {
                    level: next_level,
                    blkid: target.blkid >> (epbs * u32::from(next_level - target.level)),
                };
                let child = result.and_then(|content| {
                    BlockPointer::decode_slot(content.as_slice(), dnode.child_slot(next.blkid))
                        .map_err(|e| crate::parse_to_dbc_error(&e, bp.address))
                });
                match child {
                    Ok(child) if !child.is_hole() => {
                        shared.prefetch_step(dnode, target, next, child, priority);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(
                            target: "dbc::prefetch",
                            object = dnode.object().0,
                            level = next_level,
                            blkid = next.blkid,
                            error = %err,
                            "prefetch_abandoned"
                        );
                    }
                }
            }),
        );
    }
}
