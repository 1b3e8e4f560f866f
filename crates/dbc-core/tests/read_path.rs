#![forbid(unsafe_code)]

use dbc_block::{BlockStore, CompletionMode, IoEvent, IoPriority, MemBlockStore, ReadFlags};
use dbc_core::{DbufCache, DbufCacheConfig, DbufState, Dnode, DnodeLayout};
use dbc_error::DbcError;
use dbc_types::{BLKPTR_SIZE, BlkId, BlockPointer, BpFlags, BufIdentity, ObjectId, ObjectType, ObjsetId, Txg};
use std::sync::Arc;

const BLOCK: usize = 4096;

fn setup(mode: CompletionMode) -> (Arc<MemBlockStore>, DbufCache) {
    let store = Arc::new(MemBlockStore::new(mode));
    let config = DbufCacheConfig {
        spawn_evict_worker: false,
        ..DbufCacheConfig::default()
    };
    let cache = DbufCache::new(config, Arc::clone(&store) as Arc<dyn BlockStore>).expect("cache");
    (store, cache)
}

fn layout(nlevels: u8, nblkptr: usize) -> DnodeLayout {
    DnodeLayout {
        data_block_size: 4096,
        indirect_block_shift: 12,
        nlevels,
        nblkptr,
        ..DnodeLayout::default()
    }
}

fn dnode(object: u64, nlevels: u8) -> Arc<Dnode> {
    Dnode::new(ObjsetId(1), ObjectId(object), &layout(nlevels, 1)).expect("dnode")
}

fn leaf_id(object: u64, blkid: u64) -> BufIdentity {
    BufIdentity::new(ObjsetId(1), ObjectId(object), 0, BlkId(blkid))
}

#[test]
fn hole_reads_as_zeros_without_io() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    assert_eq!(hold.state(), DbufState::Uncached);

    let data = hold.data(ReadFlags::NONE).expect("read");
    assert_eq!(data.len(), BLOCK);
    assert!(data.is_zero());
    assert_eq!(hold.state(), DbufState::Cached);
    assert_eq!(store.read_count(), 0);
    assert_eq!(cache.stats().hole_fills, 1);
}

#[test]
fn cached_block_is_read_once() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(2, 1);
    let bp = store.preload(&[0x5A; BLOCK], ObjectType::PlainFileContents, 0, Txg(3));
    dn.set_root_blkptr(0, bp).expect("root");

    let first = cache.hold(&dn, BlkId(0)).expect("hold");
    assert_eq!(first.data(ReadFlags::NONE).expect("read").as_slice(), &[0x5A; BLOCK][..]);
    drop(first);
    assert_eq!(cache.general_tier_count(), 1);

    let second = cache.hold(&dn, BlkId(0)).expect("hold again");
    assert_eq!(cache.general_tier_count(), 0, "a hold pulls the buffer out of its tier");
    assert_eq!(second.data(ReadFlags::NONE).expect("cached").as_slice(), &[0x5A; BLOCK][..]);
    assert_eq!(store.read_count(), 1);

    let stats = cache.stats();
    assert!(stats.hash_hits >= 1);
    assert_eq!(stats.reads, 1);
}

#[test]
fn failed_read_reports_error_and_can_be_retried() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(3, 1);
    let bp = store.preload(&[1; BLOCK], ObjectType::PlainFileContents, 0, Txg(2));
    dn.set_root_blkptr(0, bp).expect("root");
    store.fail_reads_at(bp.address);

    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    let err = hold.read(ReadFlags::NONE).unwrap_err();
    assert!(matches!(err, DbcError::ReadFailed { block, .. } if block == bp.address));
    assert_eq!(hold.state(), DbufState::Uncached);
    assert_eq!(hold.hold_count(), 1, "the I/O hold is released on failure");
    assert_eq!(cache.stats().read_errors, 1);

    store.clear_read_failures();
    assert_eq!(hold.data(ReadFlags::NONE).expect("retry").as_slice(), &[1; BLOCK][..]);
}

#[test]
fn corrupted_block_surfaces_as_corruption() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(4, 1);
    let bp = store.preload(&[9; BLOCK], ObjectType::PlainFileContents, 0, Txg(2));
    dn.set_root_blkptr(0, bp).expect("root");
    store.corrupt(bp.address);

    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    assert!(matches!(hold.read(ReadFlags::NONE), Err(DbcError::Corruption { .. })));
}

#[test]
fn indirect_hole_with_birth_passes_birth_to_children() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(5, 2);
    let root = BlockPointer::hole(4096, ObjectType::PlainFileContents, 1, Txg(5));
    dn.set_root_blkptr(0, root).expect("root");
    dn.set_max_blkid(20);

    let l1 = cache.hold_level(&dn, 1, BlkId(0)).expect("hold L1");
    let content = l1.data(ReadFlags::NONE).expect("read L1");
    for slot in [0, 7, BLOCK / BLKPTR_SIZE - 1] {
        let child = BlockPointer::decode_slot(content.as_slice(), slot).expect("decode");
        assert!(child.is_hole());
        assert_eq!(child.birth, Txg(5));
        assert_eq!(child.level, 0);
        assert_eq!(child.lsize, 4096);
    }

    let leaf = cache.hold(&dn, BlkId(3)).expect("hold leaf");
    assert_eq!(leaf.blkptr().map(|bp| bp.birth), Some(Txg(5)));
    assert!(leaf.data(ReadFlags::NONE).expect("read leaf").is_zero());
    assert_eq!(store.read_count(), 0);
}

#[test]
fn hold_sparse_rejects_holes() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(6, 1);
    assert!(matches!(cache.hold_sparse(&dn, 0, BlkId(0)), Err(DbcError::Hole)));
    assert_eq!(cache.buffer_count(), 0);

    let bp = store.preload(&[3; BLOCK], ObjectType::PlainFileContents, 0, Txg(1));
    dn.set_root_blkptr(0, bp).expect("root");
    assert!(cache.hold_sparse(&dn, 0, BlkId(0)).is_ok());
}

#[test]
fn holds_beyond_the_tree_are_refused() {
    let (_store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(7, 1);
    assert!(matches!(cache.hold(&dn, BlkId(1)), Err(DbcError::NoSpace)));
    assert!(matches!(cache.hold_level(&dn, 1, BlkId(0)), Err(DbcError::NoSpace)));
}

#[test]
fn encrypted_block_needs_key_unless_raw() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = Dnode::new(
        ObjsetId(1),
        ObjectId(8),
        &DnodeLayout {
            encrypted: true,
            ..layout(1, 1)
        },
    )
    .expect("dnode");
    let mut bp = store.preload(&[4; BLOCK], ObjectType::PlainFileContents, 0, Txg(1));
    bp.flags = bp.flags.union(BpFlags::ENCRYPTED);
    dn.set_root_blkptr(0, bp).expect("root");

    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    assert!(matches!(hold.read(ReadFlags::NONE), Err(DbcError::KeyUnavailable)));
    assert_eq!(store.read_count(), 0);

    hold.read(ReadFlags::NO_DECRYPT).expect("raw read");
    assert_eq!(hold.state(), DbufState::Cached);
    drop(hold);

    dn.set_key_loaded(true);
    let again = cache.hold(&dn, BlkId(0)).expect("hold");
    assert!(again.read(ReadFlags::NONE).is_ok());
}

#[test]
fn redacted_block_is_refused_unless_allowed() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(9, 1);
    let bp = BlockPointer {
        flags: BpFlags::REDACTED,
        ..BlockPointer::hole(4096, ObjectType::PlainFileContents, 0, Txg(2))
    };
    dn.set_root_blkptr(0, bp).expect("root");

    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    assert!(matches!(hold.read(ReadFlags::NONE), Err(DbcError::Redacted)));

    cache.update_config(DbufCacheConfig {
        allow_redacted_reads: true,
        spawn_evict_worker: false,
        ..DbufCacheConfig::default()
    });
    assert!(hold.data(ReadFlags::NONE).expect("redacted zeros").is_zero());
    assert_eq!(store.read_count(), 0);
}

#[test]
fn concurrent_reader_waits_for_in_flight_read() {
    let (store, cache) = setup(CompletionMode::Deferred);
    let cache = Arc::new(cache);
    let dn = dnode(10, 1);
    let bp = store.preload(&[6; BLOCK], ObjectType::PlainFileContents, 0, Txg(1));
    dn.set_root_blkptr(0, bp).expect("root");

    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    assert!(matches!(
        hold.read(ReadFlags::NEVER_WAIT),
        Ok(())
    ), "the issuing call does not wait");
    assert!(matches!(hold.state(), DbufState::Read { .. }));
    assert!(matches!(hold.read(ReadFlags::NEVER_WAIT), Err(DbcError::Incomplete)));

    let waiter = {
        let cache = Arc::clone(&cache);
        let dn = Arc::clone(&dn);
        std::thread::spawn(move || {
            let hold = cache.hold(&dn, BlkId(0)).expect("hold");
            hold.data(ReadFlags::NONE).expect("read").as_slice()[0]
        })
    };
    while store.pending_count() == 0 {
        std::thread::yield_now();
    }
    store.complete_all();
    assert_eq!(waiter.join().expect("join"), 6);
    assert_eq!(store.read_count(), 1, "duplicate reads are gated by the Read state");
}

#[test]
fn prefetch_walks_down_from_root() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(11, 2);
    let leaf = store.preload(&[7; BLOCK], ObjectType::PlainFileContents, 0, Txg(1));
    let mut indirect = vec![0_u8; BLOCK];
    leaf.encode_slot(&mut indirect, 5).expect("encode");
    let l1 = store.preload(&indirect, ObjectType::PlainFileContents, 1, Txg(1));
    dn.set_root_blkptr(0, l1).expect("root");
    dn.set_max_blkid(31);

    assert!(cache.prefetch(&dn, 0, BlkId(5), IoPriority::AsyncRead));
    assert!(cache.contains(&leaf_id(11, 5)));
    assert_eq!(store.read_count(), 2);
    assert_eq!(cache.stats().prefetches, 1);

    let hold = cache.hold(&dn, BlkId(5)).expect("hold");
    assert_eq!(hold.data(ReadFlags::NONE).expect("read").as_slice(), &[7; BLOCK][..]);
    assert_eq!(store.read_count(), 2, "the prefetched copy is used");

    assert!(!cache.prefetch(&dn, 0, BlkId(5), IoPriority::AsyncRead), "already cached");
    assert!(!cache.prefetch(&dn, 0, BlkId(40), IoPriority::AsyncRead), "beyond maxblkid");

    assert!(cache.prefetch(&dn, 0, BlkId(6), IoPriority::AsyncRead));
    assert!(!cache.contains(&leaf_id(11, 6)), "a hole ends the chain");
}

#[test]
fn prefetch_uses_cached_parent() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(12, 2);
    let leaf = store.preload(&[8; BLOCK], ObjectType::PlainFileContents, 0, Txg(1));
    let mut indirect = vec![0_u8; BLOCK];
    leaf.encode_slot(&mut indirect, 2).expect("encode");
    let l1 = store.preload(&indirect, ObjectType::PlainFileContents, 1, Txg(1));
    dn.set_root_blkptr(0, l1).expect("root");
    dn.set_max_blkid(31);

    let parent = cache.hold_level(&dn, 1, BlkId(0)).expect("hold L1");
    parent.read(ReadFlags::NONE).expect("read L1");
    assert_eq!(store.read_count(), 1);

    assert!(!cache.prefetch(&dn, 0, BlkId(3), IoPriority::AsyncRead), "provably a hole");
    assert!(cache.prefetch(&dn, 0, BlkId(2), IoPriority::AsyncRead));
    assert_eq!(store.read_count(), 2, "only the leaf is read");
    assert!(cache.contains(&leaf_id(12, 2)));
}

#[test]
fn prefetch_reads_at_the_requested_priority() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(14, 2);
    let leaf = store.preload(&[9; BLOCK], ObjectType::PlainFileContents, 0, Txg(1));
    let mut indirect = vec![0_u8; BLOCK];
    leaf.encode_slot(&mut indirect, 4).expect("encode");
    let l1 = store.preload(&indirect, ObjectType::PlainFileContents, 1, Txg(1));
    dn.set_root_blkptr(0, l1).expect("root");
    dn.set_max_blkid(31);

    assert!(cache.prefetch(&dn, 0, BlkId(4), IoPriority::SyncRead));
    let priorities: Vec<(u64, IoPriority)> = store
        .events()
        .into_iter()
        .filter_map(|e| match e {
            IoEvent::Read { address, priority } => Some((address, priority)),
            _ => None,
        })
        .collect();
    assert_eq!(
        priorities,
        vec![(l1.address, IoPriority::SyncRead), (leaf.address, IoPriority::SyncRead)]
    );
}

#[test]
fn bonus_and_spill_buffers() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(13, 1);
    let bonus = cache.hold_bonus(&dn);
    let content = bonus.data(ReadFlags::NONE).expect("bonus");
    assert_eq!(content.len(), dn.bonus_len());
    assert!(content.is_zero());
    assert_eq!(bonus.identity().blkid, BlkId::BONUS);
    assert_eq!(store.read_count(), 0);

    let again = cache.hold_bonus(&dn);
    assert_eq!(again.hold_count(), 2);

    let spill_bp = store.preload(&[2; BLOCK], ObjectType::SystemAttributes, 0, Txg(1));
    dn.set_spill_blkptr(spill_bp);
    let spill = cache.hold_spill(&dn).expect("spill");
    assert_eq!(spill.data(ReadFlags::NONE).expect("read").as_slice(), &[2; BLOCK][..]);
}
