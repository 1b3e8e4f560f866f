#![forbid(unsafe_code)]

use dbc_block::{BlockBuf, BlockStore, CompletionMode, IoEvent, MemBlockStore, ReadFlags};
use dbc_core::{DbufCache, DbufCacheConfig, DbufState, Dnode, DnodeLayout, OverrideState};
use dbc_error::DbcError;
use dbc_types::{BlkId, BlockPointer, BufIdentity, ObjectId, ObjectType, ObjsetId, Txg};
use std::sync::Arc;

const BLOCK: usize = 4096;

fn setup(mode: CompletionMode) -> (Arc<MemBlockStore>, DbufCache) {
    let store = Arc::new(MemBlockStore::new(mode));
    let cache = new_cache(&store);
    (store, cache)
}

fn new_cache(store: &Arc<MemBlockStore>) -> DbufCache {
    let config = DbufCacheConfig {
        spawn_evict_worker: false,
        ..DbufCacheConfig::default()
    };
    DbufCache::new(config, Arc::clone(store) as Arc<dyn BlockStore>).expect("cache")
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

fn dnode(object: u64, nlevels: u8, nblkptr: usize) -> Arc<Dnode> {
    Dnode::new(ObjsetId(1), ObjectId(object), &layout(nlevels, nblkptr)).expect("dnode")
}

fn sync(cache: &DbufCache, txg: Txg) {
    cache.sync_txg(txg);
    cache.wait_txg_synced(txg).expect("txg synced");
}

fn stored(store: &MemBlockStore, bp: &BlockPointer) -> Vec<u8> {
    store.block_data(bp.address).expect("block on store")
}

fn writes(store: &MemBlockStore) -> Vec<(u8, u64)> {
    store
        .events()
        .into_iter()
        .filter_map(|e| match e {
            IoEvent::Write { level, blkid, .. } => Some((level, blkid.0)),
            _ => None,
        })
        .collect()
}

#[test]
fn older_txg_keeps_its_own_copy() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(1, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");

    hold.write_at(Txg(10), 0, &[0xAA; BLOCK]).expect("write txg 10");
    hold.write_at(Txg(11), 0, &[0xBB; BLOCK]).expect("write txg 11");

    assert_eq!(hold.dirty_count(), 2);
    assert_eq!(hold.hold_count(), 3, "one hold per dirty record");
    let older = hold.pending_content(Txg(10)).expect("txg 10 content");
    assert_eq!(older.as_slice(), &[0xAA; BLOCK][..]);
    assert_eq!(hold.content().expect("live").as_slice(), &[0xBB; BLOCK][..]);
    assert_eq!(cache.stats().cow_copies, 1);

    sync(&cache, Txg(10));
    let first = dn.root_blkptr(0).expect("root");
    assert!(!first.is_hole());
    assert_eq!(first.birth, Txg(10));
    assert_eq!(first.fill, 1);
    assert_eq!(stored(&store, &first), vec![0xAA; BLOCK]);
    assert_eq!(hold.dirty_count(), 1);

    sync(&cache, Txg(11));
    let second = dn.root_blkptr(0).expect("root");
    assert_eq!(stored(&store, &second), vec![0xBB; BLOCK]);
    assert!(!store.contains(first.address), "the replaced block is freed");
    assert!(store.events().contains(&IoEvent::Free { address: first.address }));
    assert_eq!(dn.used_bytes(), 4096);
    assert_eq!(hold.hold_count(), 1);
    assert_eq!(hold.blkptr(), Some(second));
}

#[test]
fn dirty_is_idempotent_within_a_txg() {
    let (_store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(2, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");

    let first = hold.will_dirty(Txg(4)).expect("dirty");
    let second = hold.will_dirty(Txg(4)).expect("dirty again");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.txg(), Txg(4));
    assert_eq!(hold.dirty_count(), 1);
    assert_eq!(hold.hold_count(), 2);
    assert_eq!(cache.dirty_bytes(Txg(4)), 4096);
}

#[test]
fn undirty_drops_the_record_and_its_hold() {
    let (_store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(3, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    hold.write_at(Txg(2), 100, b"abc").expect("write");
    let id = hold.identity();

    assert!(!cache.undirty(&id, Txg(2)), "still held by the caller");
    assert_eq!(hold.dirty_count(), 0);
    assert_eq!(hold.hold_count(), 1);
    assert_eq!(cache.dirty_bytes(Txg(2)), 0);
    assert!(!cache.undirty(&id, Txg(2)), "nothing left to undo");
}

#[test]
fn leaves_are_written_before_their_parents() {
    let (store, cache) = setup(CompletionMode::Deferred);
    let dn = dnode(4, 3, 1);
    let txg = Txg(1);

    let a = cache.hold(&dn, BlkId(0)).expect("hold 0");
    a.write_at(txg, 0, &[1; BLOCK]).expect("write 0");
    let b = cache.hold(&dn, BlkId(33)).expect("hold 33");
    b.write_at(txg, 0, &[2; BLOCK]).expect("write 33");
    assert_eq!(store.read_count(), 0, "holes need no I/O");

    cache.sync_txg(txg);
    assert_eq!(writes(&store), vec![(0, 0), (0, 33)], "indirects wait for children");
    store.complete_all();
    cache.wait_txg_synced(txg).expect("synced");

    let order = writes(&store);
    let pos = |level: u8, blkid: u64| {
        order
            .iter()
            .position(|w| *w == (level, blkid))
            .expect("block written")
    };
    assert!(pos(0, 0) < pos(1, 0));
    assert!(pos(0, 33) < pos(1, 1));
    assert!(pos(1, 0) < pos(2, 0));
    assert!(pos(1, 1) < pos(2, 0));
    assert_eq!(order.len(), 5);

    let root = dn.root_blkptr(0).expect("root");
    assert_eq!(root.level, 2);
    assert_eq!(root.fill, 2);
    assert_eq!(cache.dirty_bytes(txg), 0);

    store.set_mode(CompletionMode::Immediate);
    let fresh_cache = new_cache(&store);
    let fresh = dnode(4, 3, 1);
    fresh.set_root_blkptr(0, root).expect("root");
    fresh.set_max_blkid(dn.max_blkid());
    let back = fresh_cache.hold(&fresh, BlkId(33)).expect("hold");
    assert_eq!(back.data(ReadFlags::NONE).expect("read").as_slice(), &[2; BLOCK][..]);
}

#[test]
fn failed_write_is_reported_by_the_txg() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(5, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    hold.write_at(Txg(7), 0, &[5; BLOCK]).expect("write");

    store.set_fail_writes(true);
    cache.sync_txg(Txg(7));
    let err = cache.wait_txg_synced(Txg(7)).unwrap_err();
    assert!(matches!(err, DbcError::WriteFailed { txg: 7, .. }));
    assert_eq!(cache.stats().write_errors, 1);
    assert_eq!(hold.dirty_count(), 0);
    assert!(dn.root_blkptr(0).expect("root").is_hole());
    assert!(cache.wait_txg_synced(Txg(7)).is_ok(), "the error is reported once");
}

#[test]
fn completed_override_is_adopted_without_a_write() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(6, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    hold.write_at(Txg(3), 0, &[0x11; BLOCK]).expect("write");

    let content = hold.begin_override(Txg(3)).expect("begin");
    assert!(matches!(hold.begin_override(Txg(3)), Err(DbcError::Incomplete)));
    let bp = store.preload(content.as_slice(), ObjectType::PlainFileContents, 0, Txg(3));
    hold.complete_override(Txg(3), bp).expect("complete");
    let record = hold.dirty_record(Txg(3)).expect("record");
    assert_eq!(record.override_state(), Some(OverrideState::Overridden(bp)));

    sync(&cache, Txg(3));
    assert!(writes(&store).is_empty());
    assert_eq!(dn.root_blkptr(0).map(|r| r.address), Some(bp.address));
    assert_eq!(cache.stats().overrides_adopted, 1);
}

#[test]
fn aborted_override_falls_back_to_a_normal_write() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(7, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    hold.write_at(Txg(3), 0, &[0x22; BLOCK]).expect("write");

    hold.begin_override(Txg(3)).expect("begin");
    hold.abort_override(Txg(3)).expect("abort");
    assert!(hold.abort_override(Txg(3)).is_err());

    sync(&cache, Txg(3));
    assert_eq!(writes(&store), vec![(0, 0)]);
    assert_eq!(cache.stats().overrides_adopted, 0);
}

#[test]
fn redirty_discards_a_completed_override() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(8, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    hold.write_at(Txg(3), 0, &[0x33; BLOCK]).expect("write");
    let content = hold.begin_override(Txg(3)).expect("begin");
    let bp = store.preload(content.as_slice(), ObjectType::PlainFileContents, 0, Txg(3));
    hold.complete_override(Txg(3), bp).expect("complete");

    hold.write_at(Txg(3), 0, &[0x44; 8]).expect("rewrite");
    let record = hold.dirty_record(Txg(3)).expect("record");
    assert_eq!(record.override_state(), Some(OverrideState::NotOverridden));
    assert!(!store.contains(bp.address), "the out-of-band block is freed");

    sync(&cache, Txg(3));
    let root = dn.root_blkptr(0).expect("root");
    assert_eq!(&stored(&store, &root)[..8], &[0x44; 8]);
}

#[test]
fn freed_root_blocks_become_holes_at_sync() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(9, 1, 3);
    for blkid in 0..3_u64 {
        let hold = cache.hold(&dn, BlkId(blkid)).expect("hold");
        let byte = u8::try_from(blkid + 1).expect("small");
        hold.write_at(Txg(1), 0, &[byte; BLOCK]).expect("write");
    }
    sync(&cache, Txg(1));
    let before: Vec<BlockPointer> = (0..3).map(|i| dn.root_blkptr(i).expect("root")).collect();
    assert_eq!(dn.used_bytes(), 3 * 4096);

    cache.free_range(&dn, BlkId(0), BlkId(1), Txg(2));
    assert!(dn.is_block_freed(BlkId(1)));
    assert!(!dn.is_block_freed(BlkId(2)));
    let id0 = BufIdentity::new(ObjsetId(1), ObjectId(9), 0, BlkId(0));
    assert!(!cache.contains(&id0), "unheld freed buffers are dropped");

    sync(&cache, Txg(2));
    for i in 0..2 {
        let root = dn.root_blkptr(i).expect("root");
        assert!(root.is_hole());
        assert_eq!(root.birth, Txg(2));
        assert!(!store.contains(before[i].address));
    }
    assert_eq!(dn.root_blkptr(2), Some(before[2]));
    assert_eq!(dn.used_bytes(), 4096);
    assert!(!dn.is_block_freed(BlkId(0)));

    let reads = store.read_count();
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    assert!(hold.data(ReadFlags::NONE).expect("read").is_zero());
    assert_eq!(store.read_count(), reads);
}

#[test]
fn free_zeroes_held_buffer_and_punches_indirect_slot() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(10, 2, 1);
    let kept = cache.hold(&dn, BlkId(0)).expect("hold 0");
    kept.write_at(Txg(1), 0, &[7; BLOCK]).expect("write 0");
    let other = cache.hold(&dn, BlkId(1)).expect("hold 1");
    other.write_at(Txg(1), 0, &[8; BLOCK]).expect("write 1");
    drop(other);
    sync(&cache, Txg(1));
    let leaf0 = kept.blkptr().expect("leaf 0 bp");
    let leaf1 = cache
        .hold(&dn, BlkId(1))
        .expect("hold 1")
        .blkptr()
        .expect("leaf 1 bp");

    cache.free_range(&dn, BlkId(0), BlkId(0), Txg(2));
    assert!(kept.content().expect("still cached").is_zero());
    sync(&cache, Txg(2));

    let root = dn.root_blkptr(0).expect("root");
    assert_eq!(root.fill, 1);
    let indirect = stored(&store, &root);
    let slot0 = BlockPointer::decode_slot(&indirect, 0).expect("slot 0");
    assert!(slot0.is_hole());
    assert_eq!(slot0.birth, Txg(2));
    let slot1 = BlockPointer::decode_slot(&indirect, 1).expect("slot 1");
    assert_eq!(slot1.address, leaf1.address);
    assert!(!store.contains(leaf0.address));
}

#[test]
fn block_rewritten_after_free_releases_old_copy_once() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(17, 2, 1);
    let hold = cache.hold(&dn, BlkId(5)).expect("hold");
    hold.write_at(Txg(1), 0, &[0x21; BLOCK]).expect("write");
    drop(hold);
    sync(&cache, Txg(1));
    let old = cache
        .hold(&dn, BlkId(5))
        .expect("hold")
        .blkptr()
        .expect("written bp");
    assert_eq!(dn.used_bytes(), 2 * 4096);

    cache.free_range(&dn, BlkId(5), BlkId(5), Txg(2));
    let again = cache.hold(&dn, BlkId(5)).expect("hold after free");
    again.write_at(Txg(3), 0, &[0x22; 16]).expect("rewrite");
    drop(again);
    sync(&cache, Txg(2));
    sync(&cache, Txg(3));

    let frees = store
        .events()
        .into_iter()
        .filter(|e| *e == IoEvent::Free { address: old.address })
        .count();
    assert_eq!(frees, 1);
    assert_eq!(dn.used_bytes(), 2 * 4096);

    let indirect = stored(&store, &dn.root_blkptr(0).expect("root"));
    let leaf = BlockPointer::decode_slot(&indirect, 5).expect("slot 5");
    assert_ne!(leaf.address, old.address);
    let data = stored(&store, &leaf);
    assert_eq!(&data[..16], &[0x22; 16]);
    assert!(data[16..].iter().all(|b| *b == 0));
}

#[test]
fn loan_requires_sole_holder() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(11, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    hold.write_at(Txg(1), 0, &[3; BLOCK]).expect("write");
    sync(&cache, Txg(1));

    let second = hold.clone();
    assert!(matches!(hold.loan_content(), Err(DbcError::ContentShared { holders: 1 })));
    drop(second);

    let loaned = hold.loan_content().expect("loan");
    assert_eq!(loaned.as_slice(), &[3; BLOCK][..]);
    assert_eq!(hold.state(), DbufState::Uncached);

    let reads = store.read_count();
    assert_eq!(hold.data(ReadFlags::NONE).expect("reread").as_slice(), &[3; BLOCK][..]);
    assert_eq!(store.read_count(), reads + 1);
}

#[test]
fn assigned_content_replaces_the_block() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(12, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    hold.assign_content(BlockBuf::new(vec![0x5C; BLOCK]), Txg(6)).expect("assign");
    assert_eq!(hold.state(), DbufState::Cached);
    assert!(matches!(
        hold.assign_content(BlockBuf::zeroed(10), Txg(6)),
        Err(DbcError::Format(_))
    ));

    sync(&cache, Txg(6));
    let root = dn.root_blkptr(0).expect("root");
    assert_eq!(stored(&store, &root), vec![0x5C; BLOCK]);
}

#[test]
fn failed_assign_leaves_the_buffer_as_it_was() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(18, 3, 1);
    cache
        .hold(&dn, BlkId(1))
        .expect("hold")
        .write_at(Txg(1), 0, &[0x11; BLOCK])
        .expect("write");
    sync(&cache, Txg(1));
    cache.evict_dnode_dbufs(&dn);
    assert_eq!(cache.buffer_count(), 0);

    // Block 5 lies past the end of the object, so holding it reads no
    // ancestors; dirtying it must read the root indirect block.
    let root = dn.root_blkptr(0).expect("root");
    store.fail_reads_at(root.address);
    let hold = cache.hold(&dn, BlkId(5)).expect("hold");
    assert!(hold.assign_content(BlockBuf::new(vec![0x55; BLOCK]), Txg(2)).is_err());
    assert_eq!(hold.state(), DbufState::Uncached);
    assert!(hold.content().is_none());
    assert_eq!(hold.dirty_count(), 0);

    hold.read(ReadFlags::NONE).expect("hole read");
    assert!(hold.assign_content(BlockBuf::new(vec![0x55; BLOCK]), Txg(2)).is_err());
    assert_eq!(hold.state(), DbufState::Cached);
    assert_eq!(hold.content().expect("live").as_slice(), &[0; BLOCK][..]);
    assert_eq!(hold.dirty_count(), 0);

    store.clear_read_failures();
    hold.assign_content(BlockBuf::new(vec![0x55; BLOCK]), Txg(2)).expect("assign");
    assert_eq!(hold.dirty_count(), 1);
    assert_eq!(hold.content().expect("live").as_slice(), &[0x55; BLOCK][..]);
}

#[test]
fn spill_resize_keeps_leading_bytes() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(19, 1, 1);
    let spill = cache.hold_spill(&dn).expect("spill");
    assert_eq!(spill.size(), BLOCK);

    spill.write_at(Txg(1), 0, &[0x31; 100]).expect("write");
    spill.resize(1000, Txg(1)).expect("shrink");
    assert_eq!(spill.size(), 1024, "rounded up to a whole sector");
    let live = spill.content().expect("live");
    assert_eq!(live.len(), 1024);
    assert_eq!(&live.as_slice()[..100], &[0x31; 100][..]);
    assert!(live.as_slice()[100..].iter().all(|b| *b == 0));

    let leaf = cache.hold(&dn, BlkId(0)).expect("hold");
    assert!(matches!(leaf.resize(512, Txg(1)), Err(DbcError::Format(_))));
    drop(leaf);

    sync(&cache, Txg(1));
    let bp = dn.spill_blkptr();
    assert_eq!(bp.lsize, 1024);
    assert_eq!(stored(&store, &bp).len(), 1024);

    spill.resize(3000, Txg(2)).expect("grow");
    assert_eq!(spill.size(), 3072);
    sync(&cache, Txg(2));
    let grown = stored(&store, &dn.spill_blkptr());
    assert_eq!(grown.len(), 3072);
    assert_eq!(&grown[..100], &[0x31; 100][..]);
    assert!(grown[100..].iter().all(|b| *b == 0));
    assert_eq!(dn.used_bytes(), 3072);

    // A fresh buffer takes its size from the stored spill block.
    drop(spill);
    cache.evict_dnode_dbufs(&dn);
    assert_eq!(cache.hold_spill(&dn).expect("spill").size(), 3072);
}

#[test]
fn removed_spill_becomes_a_hole_at_sync() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(20, 1, 1);
    let spill = cache.hold_spill(&dn).expect("spill");
    spill.write_at(Txg(1), 0, &[0x41; BLOCK]).expect("write");
    sync(&cache, Txg(1));
    let old = dn.spill_blkptr();
    assert!(!old.is_hole());
    assert_eq!(dn.used_bytes(), 4096);

    spill.write_at(Txg(2), 0, &[0x42; 8]).expect("write");
    cache.rm_spill(&dn, Txg(2));
    assert_eq!(spill.dirty_count(), 0, "the txg 2 change is dropped");
    assert!(spill.content().expect("live").is_zero());

    sync(&cache, Txg(2));
    assert!(dn.spill_blkptr().is_hole());
    assert!(spill.blkptr().expect("bp").is_hole());
    assert_eq!(dn.used_bytes(), 0);
    let frees = store
        .events()
        .into_iter()
        .filter(|e| *e == IoEvent::Free { address: old.address })
        .count();
    assert_eq!(frees, 1);

    drop(spill);
    cache.evict_dnode_dbufs(&dn);
    let reads = store.read_count();
    let fresh = cache.hold_spill(&dn).expect("spill");
    assert!(fresh.data(ReadFlags::NONE).expect("read").is_zero());
    assert_eq!(store.read_count(), reads);

    // Writing the spill in the same txg cancels the removal.
    cache.rm_spill(&dn, Txg(3));
    fresh.write_at(Txg(3), 0, &[0x43; 8]).expect("write");
    sync(&cache, Txg(3));
    let kept = dn.spill_blkptr();
    assert!(!kept.is_hole());
    assert_eq!(&stored(&store, &kept)[..8], &[0x43; 8][..]);
}

#[test]
fn lightweight_leaf_is_written_without_a_buffer() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(13, 2, 1);
    let record = cache
        .dirty_lightweight_leaf(&dn, BlkId(3), BlockBuf::new(vec![9; BLOCK]), Txg(1))
        .expect("lightweight");
    assert!(record.is_lightweight());
    let id = BufIdentity::new(ObjsetId(1), ObjectId(13), 0, BlkId(3));
    assert!(!cache.contains(&id));
    assert!(matches!(
        cache.dirty_lightweight_leaf(&dn, BlkId(4), BlockBuf::zeroed(5), Txg(1)),
        Err(DbcError::Format(_))
    ));

    sync(&cache, Txg(1));
    assert_eq!(writes(&store), vec![(0, 3), (1, 0)]);
    assert_eq!(dn.max_blkid(), 3);
    let hold = cache.hold(&dn, BlkId(3)).expect("hold");
    assert_eq!(hold.data(ReadFlags::NONE).expect("read").as_slice(), &[9; BLOCK][..]);
}

#[test]
fn bonus_changes_land_in_the_dnode() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(14, 1, 1);
    let bonus = cache.hold_bonus(&dn);
    bonus.write_at(Txg(2), 0, b"hello").expect("write bonus");
    assert!(dn.bonus_bytes().iter().all(|b| *b == 0), "not before sync");

    sync(&cache, Txg(2));
    assert_eq!(&dn.bonus_bytes()[..5], b"hello");
    assert_eq!(dn.bonus_bytes().len(), dn.bonus_len());
    assert!(writes(&store).is_empty());
    assert_eq!(bonus.dirty_count(), 0);
}

#[test]
fn will_not_fill_writes_zeros() {
    let (store, cache) = setup(CompletionMode::Immediate);
    let dn = dnode(15, 1, 1);
    let hold = cache.hold(&dn, BlkId(0)).expect("hold");
    hold.will_not_fill(Txg(1)).expect("no fill");
    assert_eq!(hold.state(), DbufState::NoFill);
    assert!(hold.content().is_none());

    sync(&cache, Txg(1));
    assert_eq!(writes(&store), vec![(0, 0)]);
    assert!(dn.root_blkptr(0).expect("root").is_hole(), "zeros compress to a hole");
}
