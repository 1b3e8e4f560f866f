#![forbid(unsafe_code)]
//! Block content layer beneath the dbuf cache.
//!
//! Defines the [`BlockStore`] trait through which the cache reads, writes
//! and frees blocks, the shared [`BlockBuf`] content type, read flags and
//! I/O priorities, and [`MemBlockStore`], an in-memory store used by tests
//! and benchmarks.
//!
//! All store operations are asynchronous from the caller's point of view:
//! they accept a completion callback and may invoke it either before
//! returning or later from another thread.

use dbc_error::Result;
use dbc_types::{BlkId, BlockPointer, ObjectId, ObjectType, ObjsetId, Txg};
use serde::{Deserialize, Serialize};
use std::ops::BitOr;
use std::sync::Arc;

mod mem_store;

pub use mem_store::{CompletionMode, IoEvent, MemBlockStore};

/// Reference-counted block content.
///
/// Clones share one allocation. [`BlockBuf::make_mut`] copies only when the
/// allocation is shared, so a pending write holding a clone never observes
/// later in-place edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0_u8; len])
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Mutable access, copying first if another clone shares the bytes.
    pub fn make_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.bytes).as_mut_slice()
    }

    /// Whether both buffers share one allocation.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.bytes, &b.bytes)
    }

    /// An unshared copy of the bytes.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        Self::new(self.bytes.as_ref().clone())
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        Arc::try_unwrap(self.bytes).unwrap_or_else(|shared| shared.as_ref().clone())
    }
}

/// Flags modifying a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadFlags(pub u32);

impl ReadFlags {
    pub const NONE: Self = Self(0);
    /// Do not trigger prefetch of neighbouring blocks.
    pub const NO_PREFETCH: Self = Self(1 << 0);
    /// The caller handles failure; do not treat errors as fatal.
    pub const CAN_FAIL: Self = Self(1 << 1);
    /// Return `Incomplete` instead of waiting on an in-flight read.
    pub const NEVER_WAIT: Self = Self(1 << 2);
    /// Return raw (still encrypted) content without key checks.
    pub const NO_DECRYPT: Self = Self(1 << 3);
    /// The read was issued by the prefetch engine.
    pub const PREFETCH: Self = Self(1 << 4);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ReadFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Scheduling class for an I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoPriority {
    SyncRead,
    SyncWrite,
    AsyncRead,
    AsyncWrite,
}

/// Per-write parameters derived from the owning object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePolicy {
    pub object_type: ObjectType,
    pub level: u8,
    /// Whether all-zero content may be written as a hole.
    pub compress: bool,
    pub encrypt: bool,
    pub copies: u8,
}

/// One block write handed to the store.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub objset: ObjsetId,
    pub object: ObjectId,
    pub level: u8,
    pub blkid: BlkId,
    pub txg: Txg,
    pub data: BlockBuf,
    pub policy: WritePolicy,
    pub priority: IoPriority,
}

pub type ReadDone = Box<dyn FnOnce(Result<BlockBuf>) + Send + 'static>;
pub type WriteDone = Box<dyn FnOnce(Result<BlockPointer>) + Send + 'static>;

/// Block store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub frees: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

/// Block content collaborator.
///
/// Implementations load, verify and decompress content for a block pointer,
/// and allocate, checksum and persist new content. Callbacks must not be
/// invoked while holding any lock the callback might re-enter.
pub trait BlockStore: Send + Sync {
    /// Fetch the content described by `bp`.
    fn read_block(&self, bp: &BlockPointer, priority: IoPriority, flags: ReadFlags, done: ReadDone);

    /// Allocate and write new content; the callback receives the committed
    /// block pointer.
    fn write_block(&self, request: WriteRequest, done: WriteDone);

    /// Release a block that is no longer referenced as of `txg`.
    fn free_block(&self, txg: Txg, bp: &BlockPointer);

    /// Current size of the content cache beneath this layer, in bytes.
    ///
    /// The dbuf cache sizes its tiers as a fraction of this value.
    fn cache_size_bytes(&self) -> u64;

    /// Current statistics.
    fn stats(&self) -> BlockStoreStats;
}
