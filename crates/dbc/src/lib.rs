#![forbid(unsafe_code)]
//! Dbuf cache public API facade.
//!
//! Re-exports the cache from `dbc-core` together with the block store,
//! error and on-disk types it is driven with. Downstream consumers depend
//! on this crate only.

pub use dbc_core::*;

pub use dbc_block::{
    BlockBuf, BlockStore, BlockStoreStats, CompletionMode, IoEvent, IoPriority, MemBlockStore,
    ReadDone, ReadFlags, WriteDone, WritePolicy, WriteRequest,
};
pub use dbc_error::{DbcError, Result};
pub use dbc_types::{
    BlkId, BlockPointer, BpFlags, BufIdentity, ObjectId, ObjectType, ObjsetId, Txg,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn facade_drives_a_write_and_read_back() {
        let store = Arc::new(MemBlockStore::new(CompletionMode::Immediate));
        let config = DbufCacheConfig {
            spawn_evict_worker: false,
            ..DbufCacheConfig::default()
        };
        let cache = DbufCache::new(config, Arc::clone(&store) as Arc<dyn BlockStore>).expect("cache");
        let layout = DnodeLayout {
            data_block_size: 4096,
            indirect_block_shift: 12,
            ..DnodeLayout::default()
        };
        let dn = Dnode::new(ObjsetId(1), ObjectId(1), &layout).expect("dnode");

        let hold = cache.hold(&dn, BlkId(0)).expect("hold");
        hold.write_at(Txg(1), 0, b"facade").expect("write");
        drop(hold);
        cache.sync_txg(Txg(1));
        cache.wait_txg_synced(Txg(1)).expect("synced");

        let bp = dn.root_blkptr(0).expect("root pointer");
        assert!(!bp.is_hole());
        assert_eq!(&store.block_data(bp.address).expect("stored")[..6], b"facade");
    }
}
