#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod blkptr;

pub use blkptr::{BLKPTR_SHIFT, BLKPTR_SIZE, BlockPointer, BpFlags, Checksum};

/// Number of transaction groups that may hold dirty state at once
/// (open, quiescing, syncing).
pub const TXG_CONCURRENT_STATES: usize = 3;

/// Smallest supported block size (512 bytes).
pub const MIN_BLOCK_SHIFT: u8 = 9;
/// Largest supported block size (16 MiB).
pub const MAX_BLOCK_SHIFT: u8 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjsetId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Block index within one level of an object's block tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlkId(pub u64);

impl BlkId {
    /// The bonus buffer embedded in the object's dnode.
    pub const BONUS: Self = Self(u64::MAX);
    /// The spill block referenced from the object's dnode.
    pub const SPILL: Self = Self(u64::MAX - 1);

    #[must_use]
    pub fn is_special(self) -> bool {
        self == Self::BONUS || self == Self::SPILL
    }
}

/// Transaction group number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Txg(pub u64);

impl Txg {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Whether `self` was born after `other` was synced.
    #[must_use]
    pub fn is_after(self, other: Self) -> bool {
        self.0 > other.0
    }
}

/// Full identity of a cached block.
///
/// Immutable for the lifetime of a buffer; the identity table guarantees at
/// most one live buffer per value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufIdentity {
    pub objset: ObjsetId,
    pub object: ObjectId,
    pub level: u8,
    pub blkid: BlkId,
}

impl BufIdentity {
    #[must_use]
    pub fn new(objset: ObjsetId, object: ObjectId, level: u8, blkid: BlkId) -> Self {
        Self {
            objset,
            object,
            level,
            blkid,
        }
    }

    #[must_use]
    pub fn is_bonus(&self) -> bool {
        self.blkid == BlkId::BONUS
    }

    #[must_use]
    pub fn is_spill(&self) -> bool {
        self.blkid == BlkId::SPILL
    }
}

/// Object types that own cached blocks.
///
/// The byte values are the on-disk encoding used in block-pointer slots.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ObjectType {
    #[default]
    None = 0,
    ObjectDirectory = 1,
    ObjectArray = 2,
    PackedNvlist = 3,
    Bpobj = 4,
    SpaceMap = 5,
    IntentLog = 6,
    Dnode = 7,
    Objset = 8,
    DslDir = 9,
    DslDirChildMap = 10,
    DslProps = 11,
    DslDataset = 12,
    Znode = 13,
    PlainFileContents = 14,
    DirectoryContents = 15,
    MasterNode = 16,
    Zvol = 17,
    SystemAttributes = 18,
}

impl ObjectType {
    /// Whether blocks of this type hold filesystem structure rather than
    /// user data.
    #[must_use]
    pub fn is_metadata(self) -> bool {
        !matches!(self, Self::PlainFileContents | Self::Zvol)
    }

    /// Whether released blocks of this type prefer the metadata tier.
    ///
    /// Limited to the pool-administrative objects walked by dataset listing.
    #[must_use]
    pub fn is_metadata_cached(self) -> bool {
        matches!(
            self,
            Self::ObjectDirectory
                | Self::DslDir
                | Self::DslDirChildMap
                | Self::DslProps
                | Self::DslDataset
                | Self::MasterNode
        )
    }
}

impl TryFrom<u8> for ObjectType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::None,
            1 => Self::ObjectDirectory,
            2 => Self::ObjectArray,
            3 => Self::PackedNvlist,
            4 => Self::Bpobj,
            5 => Self::SpaceMap,
            6 => Self::IntentLog,
            7 => Self::Dnode,
            8 => Self::Objset,
            9 => Self::DslDir,
            10 => Self::DslDirChildMap,
            11 => Self::DslProps,
            12 => Self::DslDataset,
            13 => Self::Znode,
            14 => Self::PlainFileContents,
            15 => Self::DirectoryContents,
            16 => Self::MasterNode,
            17 => Self::Zvol,
            18 => Self::SystemAttributes,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "bp.type",
                    reason: "unknown object type",
                });
            }
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

impl fmt::Display for ObjsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BONUS => f.write_str("bonus"),
            Self::SPILL => f.write_str("spill"),
            Self(n) => write!(f, "{n}"),
        }
    }
}

impl fmt::Display for Txg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BufIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.objset, self.object, self.level, self.blkid
        )
    }
}
