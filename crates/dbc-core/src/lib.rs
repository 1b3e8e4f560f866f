#![forbid(unsafe_code)]
//! In-memory cache of object blocks for a copy-on-write storage pool.
//!
//! A [`DbufCache`] maps `(objset, object, level, blkid)` identities to
//! buffers. Each buffer tracks its read state, its holders, and one dirty
//! record per open txg whose changes are not yet on disk. Unheld buffers
//! sit in a metadata or general LRU tier until a background worker evicts
//! them. Syncing a txg writes dirty leaves first, installs their new block
//! pointers into their parents and then writes the parents.
//!
//! Object geometry, root block pointers and freed ranges belong to
//! [`Dnode`]; block I/O belongs to a [`dbc_block::BlockStore`].
//!
//! # Logging
//!
//! All events go through `tracing`, one target per pipeline:
//!
//! | Target | Events |
//! |--------|--------|
//! | `dbc::cache` | buffer creation, destruction, cache lifecycle |
//! | `dbc::read` | hole fills, read issue, read failures |
//! | `dbc::write` | new dirty records, snapshots, overrides, frees |
//! | `dbc::sync` | write issue and completion, write errors |
//! | `dbc::evict` | eviction cycles and worker lifecycle |
//! | `dbc::prefetch` | prefetch chains |
//! | `dbc::config` | tunable updates, ignored overrides |

mod arena;
mod cache;
mod config;
mod dbuf;
mod dirty;
mod dnode;
mod evict;
mod hash;
mod prefetch;
mod read;
mod stats;
mod sync;
mod txg;
mod write;

pub use arena::DbufIndex;
pub use cache::DbufCache;
pub use config::{DbufCacheConfig, Tunables};
pub use dbuf::{DbufHold, DbufState, DbufUser, UserRef};
pub use dirty::{DirtyRecord, OverrideState};
pub use dnode::{CachePolicy, Dnode, DnodeLayout, MAX_LEVELS, MAX_NBLKPTR};
pub use evict::CacheTier;
pub use stats::{DbufStatsSnapshot, MAX_TRACKED_LEVELS};

use dbc_error::DbcError;
use dbc_types::ParseError;

/// Map a block-pointer decode failure inside block `block` to a cache error.
///
/// A field that decodes but holds an impossible value is a format problem;
/// a short slot means the block content itself is damaged.
pub(crate) fn parse_to_dbc_error(e: &ParseError, block: u64) -> DbcError {
    match e {
        ParseError::InvalidField { field, reason } => DbcError::Format(format!("{field}: {reason}")),
        ParseError::InsufficientData { .. } => DbcError::Corruption {
            block,
            detail: e.to_string(),
        },
        ParseError::IntegerConversion { .. } => DbcError::Parse(e.to_string()),
    }
}
