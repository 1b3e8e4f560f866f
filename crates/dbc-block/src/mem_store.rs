//! In-memory block store for tests and benchmarks.
//!
//! Blocks live in a `HashMap` keyed by address. Every write allocates a
//! fresh address and records a blake3 checksum in the returned pointer;
//! reads verify it. Completions either run inline ([`CompletionMode::Immediate`])
//! or queue until [`MemBlockStore::complete_all`] drains them
//! ([`CompletionMode::Deferred`]), which lets tests hold writes in flight.

use crate::{
    BlockBuf, BlockStore, BlockStoreStats, IoPriority, ReadDone, ReadFlags, WriteDone,
    WriteRequest,
};
use dbc_error::DbcError;
use dbc_types::{BlkId, BlockPointer, BpFlags, ObjectId, ObjectType, Txg};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::trace;

const FIRST_ADDRESS: u64 = 0x1000;
const ALLOC_ALIGN: u64 = 512;
const DEFAULT_CACHE_SIZE: u64 = 1 << 30;

/// When completion callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Before `read_block`/`write_block` returns.
    Immediate,
    /// When the test drains the queue.
    Deferred,
}

/// One issued operation, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    Read {
        address: u64,
        priority: IoPriority,
    },
    Write {
        object: ObjectId,
        level: u8,
        blkid: BlkId,
        txg: Txg,
    },
    Free {
        address: u64,
    },
}

type Completion = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct StoredBlock {
    data: Vec<u8>,
    checksum: [u8; 32],
}

struct Inner {
    blocks: HashMap<u64, StoredBlock>,
    next_address: u64,
    pending: VecDeque<Completion>,
    events: Vec<IoEvent>,
    failing_reads: HashSet<u64>,
    fail_writes: bool,
    mode: CompletionMode,
    cache_size: u64,
    stats: BlockStoreStats,
}

pub struct MemBlockStore {
    inner: Mutex<Inner>,
}

impl MemBlockStore {
    #[must_use]
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: HashMap::new(),
                next_address: FIRST_ADDRESS,
                pending: VecDeque::new(),
                events: Vec::new(),
                failing_reads: HashSet::new(),
                fail_writes: false,
                mode,
                cache_size: DEFAULT_CACHE_SIZE,
                stats: BlockStoreStats::default(),
            }),
        }
    }

    pub fn set_mode(&self, mode: CompletionMode) {
        self.inner.lock().mode = mode;
    }

    /// Set the value reported by [`BlockStore::cache_size_bytes`].
    pub fn set_cache_size_bytes(&self, bytes: u64) {
        self.inner.lock().cache_size = bytes;
    }

    /// Store `data` directly, as if written in an earlier session.
    pub fn preload(&self, data: &[u8], object_type: ObjectType, level: u8, birth: Txg) -> BlockPointer {
        let mut inner = self.inner.lock();
        let (address, checksum) = inner.allocate(data);
        BlockPointer {
            address,
            lsize: len_u32(data.len()),
            psize: len_u32(data.len()),
            birth,
            fill: 1,
            level,
            object_type,
            flags: BpFlags::NONE,
            checksum,
        }
    }

    /// Make every later read of `address` fail.
    pub fn fail_reads_at(&self, address: u64) {
        self.inner.lock().failing_reads.insert(address);
    }

    pub fn clear_read_failures(&self) {
        self.inner.lock().failing_reads.clear();
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Overwrite stored bytes without updating the checksum.
    pub fn corrupt(&self, address: u64) {
        if let Some(block) = self.inner.lock().blocks.get_mut(&address) {
            if let Some(first) = block.data.first_mut() {
                *first ^= 0xFF;
            }
        }
    }

    /// Raw bytes stored at `address`.
    #[must_use]
    pub fn block_data(&self, address: u64) -> Option<Vec<u8>> {
        self.inner.lock().blocks.get(&address).map(|b| b.data.clone())
    }

    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.inner.lock().blocks.contains_key(&address)
    }

    #[must_use]
    pub fn events(&self) -> Vec<IoEvent> {
        self.inner.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.inner.lock().events.clear();
    }

    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.inner.lock().stats.reads
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.inner.lock().stats.writes
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Run the oldest queued completion. Returns `false` when none is queued.
    pub fn complete_one(&self) -> bool {
        let next = self.inner.lock().pending.pop_front();
        match next {
            Some(completion) => {
                completion();
                true
            }
            None => false,
        }
    }

    /// Run queued completions, including ones queued by completions, until
    /// the queue is empty. Returns how many ran.
    pub fn complete_all(&self) -> usize {
        let mut ran = 0;
        while self.complete_one() {
            ran += 1;
        }
        ran
    }

    fn dispatch(&self, completion: Completion) {
        let mut inner = self.inner.lock();
        if inner.mode == CompletionMode::Deferred {
            inner.pending.push_back(completion);
            return;
        }
        drop(inner);
        completion();
    }
}

impl Inner {
    fn allocate(&mut self, data: &[u8]) -> (u64, [u8; 32]) {
        let address = self.next_address;
        let len = u64::try_from(data.len()).unwrap_or(u64::MAX);
        self.next_address = address + len.div_ceil(ALLOC_ALIGN).max(1) * ALLOC_ALIGN;
        let checksum = *blake3::hash(data).as_bytes();
        self.blocks.insert(
            address,
            StoredBlock {
                data: data.to_vec(),
                checksum,
            },
        );
        (address, checksum)
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl std::fmt::Debug for MemBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemBlockStore")
            .field("blocks", &inner.blocks.len())
            .field("pending", &inner.pending.len())
            .field("mode", &inner.mode)
            .finish_non_exhaustive()
    }
}

impl BlockStore for MemBlockStore {
    fn read_block(&self, bp: &BlockPointer, priority: IoPriority, _flags: ReadFlags, done: ReadDone) {
        let address = bp.address;
        let result = {
            let mut inner = self.inner.lock();
            inner.stats.reads += 1;
            inner.events.push(IoEvent::Read { address, priority });
            let result = if inner.failing_reads.contains(&address) {
                Err(DbcError::ReadFailed {
                    block: address,
                    detail: "injected read failure".to_owned(),
                })
            } else {
                match inner.blocks.get(&address) {
                    None => Err(DbcError::ReadFailed {
                        block: address,
                        detail: "no block at address".to_owned(),
                    }),
                    Some(block) if block.checksum != bp.checksum => Err(DbcError::Corruption {
                        block: address,
                        detail: "checksum mismatch".to_owned(),
                    }),
                    Some(block) if *blake3::hash(&block.data).as_bytes() != block.checksum => {
                        Err(DbcError::Corruption {
                            block: address,
                            detail: "content does not match stored checksum".to_owned(),
                        })
                    }
                    Some(block) => Ok(BlockBuf::new(block.data.clone())),
                }
            };
            match &result {
                Ok(buf) => inner.stats.bytes_read += u64::try_from(buf.len()).unwrap_or(0),
                Err(_) => inner.stats.read_errors += 1,
            }
            result
        };
        trace!(address, ok = result.is_ok(), "mem_store_read");
        self.dispatch(Box::new(move || done(result)));
    }

    fn write_block(&self, request: WriteRequest, done: WriteDone) {
        let result = {
            let mut inner = self.inner.lock();
            inner.stats.writes += 1;
            inner.events.push(IoEvent::Write {
                object: request.object,
                level: request.level,
                blkid: request.blkid,
                txg: request.txg,
            });
            let data = request.data.as_slice();
            if inner.fail_writes {
                inner.stats.write_errors += 1;
                Err(DbcError::WriteFailed {
                    txg: request.txg.0,
                    detail: "injected write failure".to_owned(),
                })
            } else if request.policy.compress && request.data.is_zero() {
                // All-zero content compresses to nothing.
                Ok(BlockPointer::hole(
                    len_u32(data.len()),
                    request.policy.object_type,
                    request.level,
                    request.txg,
                ))
            } else {
                inner.stats.bytes_written += u64::try_from(data.len()).unwrap_or(0);
                let (address, checksum) = inner.allocate(data);
                let flags = if request.policy.encrypt {
                    BpFlags::ENCRYPTED
                } else {
                    BpFlags::NONE
                };
                Ok(BlockPointer {
                    address,
                    lsize: len_u32(data.len()),
                    psize: len_u32(data.len()),
                    birth: request.txg,
                    fill: 0,
                    level: request.level,
                    object_type: request.policy.object_type,
                    flags,
                    checksum,
                })
            }
        };
        trace!(
            object = request.object.0,
            level = request.level,
            blkid = request.blkid.0,
            txg = request.txg.0,
            ok = result.is_ok(),
            "mem_store_write"
        );
        self.dispatch(Box::new(move || done(result)));
    }

    fn free_block(&self, _txg: Txg, bp: &BlockPointer) {
        if bp.is_hole() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.stats.frees += 1;
        inner.events.push(IoEvent::Free {
            address: bp.address,
        });
        inner.blocks.remove(&bp.address);
    }

    fn cache_size_bytes(&self) -> u64 {
        self.inner.lock().cache_size
    }

    fn stats(&self) -> BlockStoreStats {
        self.inner.lock().stats.clone()
    }
}
