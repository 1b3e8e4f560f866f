#![forbid(unsafe_code)]
//! Error types for the dbuf cache.
//!
//! # Error Taxonomy
//!
//! The cache uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `dbc-types` | Malformed block-pointer slots inside indirect content |
//! | Runtime | `DbcError` | `dbc-error` (this crate) | Errors returned by cache operations |
//!
//! `dbc-error` does not depend on `dbc-types`. The `ParseError` → `DbcError`
//! conversion lives in `dbc-core`, which depends on both.
//!
//! ## Propagation
//!
//! - Read failures are local to the requesting call chain. Every caller
//!   waiting on the same in-flight read receives the same error.
//! - Write failures are recorded against their transaction group and
//!   surfaced by the commit path (`wait_txg_synced`).
//! - Prefetch and eviction never surface errors.
//! - Invariant violations (two live buffers for one identity, destroying a
//!   held buffer) are panics, not `DbcError`s.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`DbcError::to_errno`].
//! The match is exhaustive so a new variant is a compile error until its
//! errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `ReadFailed` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `WriteFailed` | `EIO` |
//! | `KeyUnavailable` | `EACCES` |
//! | `Redacted` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `Hole` | `ENOENT` |
//! | `NoSpace` | `ENOSPC` |
//! | `ContentShared` | `EBUSY` |
//! | `Incomplete` | `EAGAIN` |
//! | `Cancelled` | `EINTR` |

use thiserror::Error;

/// Unified error type for all cache operations.
#[derive(Debug, Error)]
pub enum DbcError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The block collaborator failed to produce content for a read.
    #[error("read failed at block {block:#x}: {detail}")]
    ReadFailed { block: u64, detail: String },

    /// Content read back does not match its block pointer.
    ///
    /// Also used for consistency failures such as a block pointer that
    /// should describe a hole but does not.
    #[error("corrupt block {block:#x}: {detail}")]
    Corruption { block: u64, detail: String },

    /// A block write failed; recorded against its transaction group.
    #[error("write failed in txg {txg}: {detail}")]
    WriteFailed { txg: u64, detail: String },

    /// The block is encrypted and the owning dataset's key is not loaded.
    #[error("encryption key unavailable")]
    KeyUnavailable,

    /// The block was redacted and redacted reads are not permitted.
    #[error("block is redacted")]
    Redacted,

    /// Structurally invalid geometry or configuration.
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    ///
    /// Carries the string form of a `ParseError` from `dbc-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// Named object or buffer not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A sparse-failing hold landed on an unallocated block.
    #[error("block is a hole")]
    Hole,

    /// Resource exhaustion. Retryable.
    #[error("no space left")]
    NoSpace,

    /// Content cannot be loaned while other holders can observe it.
    #[error("buffer content is shared with {holders} other holder(s)")]
    ContentShared { holders: u64 },

    /// A non-waiting read found the buffer busy.
    #[error("read incomplete")]
    Incomplete,

    /// Operation abandoned because the cache is shutting down.
    #[error("operation cancelled")]
    Cancelled,
}

impl DbcError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `KeyUnavailable` → `EACCES`: the data exists but cannot be decrypted.
    /// - `Hole` → `ENOENT`: sparse-failing holds treat a hole as absent.
    /// - `ContentShared` → `EBUSY`: retry after other holders release.
    /// - `Incomplete` → `EAGAIN`: the caller opted out of waiting.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ReadFailed { .. }
            | Self::Corruption { .. }
            | Self::WriteFailed { .. }
            | Self::Redacted => libc::EIO,
            Self::KeyUnavailable => libc::EACCES,
            Self::Format(_) | Self::Parse(_) => libc::EINVAL,
            Self::NotFound(_) | Self::Hole => libc::ENOENT,
            Self::NoSpace => libc::ENOSPC,
            Self::ContentShared { .. } => libc::EBUSY,
            Self::Incomplete => libc::EAGAIN,
            Self::Cancelled => libc::EINTR,
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoSpace | Self::Incomplete | Self::ContentShared { .. }
        )
    }
}

impl Clone for DbcError {
    /// `std::io::Error` is not `Clone`; the clone keeps its kind and message.
    ///
    /// Needed because one failed read is reported to every waiter.
    fn clone(&self) -> Self {
        match self {
            Self::Io(err) => Self::Io(match err.raw_os_error() {
                Some(code) => std::io::Error::from_raw_os_error(code),
                None => std::io::Error::new(err.kind(), err.to_string()),
            }),
            Self::ReadFailed { block, detail } => Self::ReadFailed {
                block: *block,
                detail: detail.clone(),
            },
            Self::Corruption { block, detail } => Self::Corruption {
                block: *block,
                detail: detail.clone(),
            },
            Self::WriteFailed { txg, detail } => Self::WriteFailed {
                txg: *txg,
                detail: detail.clone(),
            },
            Self::KeyUnavailable => Self::KeyUnavailable,
            Self::Redacted => Self::Redacted,
            Self::Format(s) => Self::Format(s.clone()),
            Self::Parse(s) => Self::Parse(s.clone()),
            Self::NotFound(s) => Self::NotFound(s.clone()),
            Self::Hole => Self::Hole,
            Self::NoSpace => Self::NoSpace,
            Self::ContentShared { holders } => Self::ContentShared { holders: *holders },
            Self::Incomplete => Self::Incomplete,
            Self::Cancelled => Self::Cancelled,
        }
    }
}

/// Result alias using `DbcError`.
pub type Result<T> = std::result::Result<T, DbcError>;
