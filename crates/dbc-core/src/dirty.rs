//! Dirty records: one per buffer per open txg.
//!
//! A leaf record either shares the buffer's live content (`data == None`,
//! only ever true of the newest record) or owns a private snapshot. An
//! indirect record owns the records of its dirty children. A lightweight
//! record carries content for a level-0 block that never had a buffer.

use crate::dbuf::Dbuf;
use crate::dnode::Dnode;
use dbc_block::BlockBuf;
use dbc_types::{BlkId, BlockPointer, BufIdentity, Txg};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Progress of an out-of-band write that replaces a leaf's sync write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideState {
    NotOverridden,
    /// The out-of-band write is in flight; sync and re-dirty wait.
    InDmuSync,
    /// Sync adopts this pointer instead of writing.
    Overridden(BlockPointer),
}

pub(crate) enum RecordOwner {
    Buffer(Arc<Dbuf>),
    Lightweight(Arc<Dnode>),
}

pub(crate) enum RecordBody {
    Leaf {
        data: Option<BlockBuf>,
        override_state: OverrideState,
    },
    Indirect {
        children: Vec<Arc<DirtyRecord>>,
    },
    Lightweight {
        data: BlockBuf,
    },
}

/// Pending change to one block for one txg.
pub struct DirtyRecord {
    txg: Txg,
    identity: BufIdentity,
    pub(crate) owner: RecordOwner,
    pub(crate) body: Mutex<RecordBody>,
    parent: Mutex<Weak<DirtyRecord>>,
    accounted: u64,
}

impl std::fmt::Debug for DirtyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyRecord")
            .field("txg", &self.txg)
            .field("identity", &self.identity)
            .field("lightweight", &self.is_lightweight())
            .finish_non_exhaustive()
    }
}

impl DirtyRecord {
    pub(crate) fn for_buffer(db: &Arc<Dbuf>, txg: Txg) -> Self {
        let body = if db.id.level == 0 {
            RecordBody::Leaf {
                data: None,
                override_state: OverrideState::NotOverridden,
            }
        } else {
            RecordBody::Indirect {
                children: Vec::new(),
            }
        };
        Self {
            txg,
            identity: db.id,
            owner: RecordOwner::Buffer(Arc::clone(db)),
            body: Mutex::new(body),
            parent: Mutex::new(Weak::new()),
            accounted: u64::try_from(db.size()).unwrap_or(u64::MAX),
        }
    }

    pub(crate) fn lightweight(dnode: &Arc<Dnode>, blkid: BlkId, data: BlockBuf, txg: Txg) -> Self {
        Self {
            txg,
            identity: BufIdentity::new(dnode.objset(), dnode.object(), 0, blkid),
            owner: RecordOwner::Lightweight(Arc::clone(dnode)),
            accounted: u64::try_from(data.len()).unwrap_or(u64::MAX),
            body: Mutex::new(RecordBody::Lightweight { data }),
            parent: Mutex::new(Weak::new()),
        }
    }

    #[must_use]
    pub fn txg(&self) -> Txg {
        self.txg
    }

    #[must_use]
    pub fn identity(&self) -> BufIdentity {
        self.identity
    }

    #[must_use]
    pub fn is_lightweight(&self) -> bool {
        matches!(self.owner, RecordOwner::Lightweight(_))
    }

    /// Override progress of a leaf record; `None` for other records.
    #[must_use]
    pub fn override_state(&self) -> Option<OverrideState> {
        match &*self.body.lock() {
            RecordBody::Leaf { override_state, .. } => Some(*override_state),
            _ => None,
        }
    }

    /// Whether this leaf owns a snapshot distinct from the live content.
    #[must_use]
    pub fn has_private_copy(&self) -> bool {
        matches!(&*self.body.lock(), RecordBody::Leaf { data: Some(_), .. })
    }

    /// Content owned by the record, if any.
    #[must_use]
    pub fn owned_content(&self) -> Option<BlockBuf> {
        match &*self.body.lock() {
            RecordBody::Leaf { data, .. } => data.clone(),
            RecordBody::Lightweight { data } => Some(data.clone()),
            RecordBody::Indirect { .. } => None,
        }
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        match &*self.body.lock() {
            RecordBody::Indirect { children } => children.len(),
            _ => 0,
        }
    }

    pub(crate) fn accounted(&self) -> u64 {
        self.accounted
    }

    pub(crate) fn buffer(&self) -> Option<&Arc<Dbuf>> {
        match &self.owner {
            RecordOwner::Buffer(db) => Some(db),
            RecordOwner::Lightweight(_) => None,
        }
    }

    pub(crate) fn parent(&self) -> Option<Arc<DirtyRecord>> {
        self.parent.lock().upgrade()
    }

    /// Link `child` under `parent`.
    pub(crate) fn adopt(parent: &Arc<Self>, child: &Arc<Self>) {
        *child.parent.lock() = Arc::downgrade(parent);
        if let RecordBody::Indirect { children } = &mut *parent.body.lock() {
            children.push(Arc::clone(child));
        }
    }

    pub(crate) fn remove_child(&self, child: &Arc<Self>) {
        if let RecordBody::Indirect { children } = &mut *self.body.lock() {
            children.retain(|c| !Arc::ptr_eq(c, child));
        }
    }

    pub(crate) fn take_children(&self) -> Vec<Arc<Self>> {
        match &mut *self.body.lock() {
            RecordBody::Indirect { children } => std::mem::take(children),
            _ => Vec::new(),
        }
    }
}
