//! Block pointers and their fixed-size slot encoding.
//!
//! Indirect block content is an array of [`BLKPTR_SIZE`]-byte slots, one
//! per child. Slot layout (little-endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 8 | address (0 = not allocated) |
//! | 8 | 4 | logical size |
//! | 12 | 4 | physical size |
//! | 16 | 8 | birth txg |
//! | 24 | 8 | fill count |
//! | 32 | 1 | level |
//! | 33 | 1 | object type |
//! | 34 | 1 | flags |
//! | 48 | 32 | checksum |
//!
//! Remaining bytes are reserved and written as zero.

use crate::{ObjectType, ParseError, Txg, ensure_slice, read_fixed, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of one encoded block pointer.
pub const BLKPTR_SIZE: usize = 128;
/// `log2(BLKPTR_SIZE)`.
pub const BLKPTR_SHIFT: u8 = 7;

const OFF_ADDRESS: usize = 0;
const OFF_LSIZE: usize = 8;
const OFF_PSIZE: usize = 12;
const OFF_BIRTH: usize = 16;
const OFF_FILL: usize = 24;
const OFF_LEVEL: usize = 32;
const OFF_TYPE: usize = 33;
const OFF_FLAGS: usize = 34;
const OFF_CHECKSUM: usize = 48;

pub type Checksum = [u8; 32];

/// Block pointer flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BpFlags(pub u8);

impl BpFlags {
    pub const NONE: Self = Self(0);
    /// Content was removed by a redacted send; no data exists.
    pub const REDACTED: Self = Self(1 << 0);
    /// Content is encrypted with the owning dataset's key.
    pub const ENCRYPTED: Self = Self(1 << 1);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// On-disk location and descriptor of one block.
///
/// A hole has address 0 but may still carry size, type, level and birth so
/// that freed ranges remember when they were punched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    pub address: u64,
    pub lsize: u32,
    pub psize: u32,
    pub birth: Txg,
    pub fill: u64,
    pub level: u8,
    pub object_type: ObjectType,
    pub flags: BpFlags,
    pub checksum: Checksum,
}

impl BlockPointer {
    /// A hole describing an unallocated block of the given shape.
    #[must_use]
    pub fn hole(lsize: u32, object_type: ObjectType, level: u8, birth: Txg) -> Self {
        Self {
            lsize,
            object_type,
            level,
            birth,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.address == 0 && !self.is_redacted()
    }

    #[must_use]
    pub fn is_redacted(&self) -> bool {
        self.flags.contains(BpFlags::REDACTED)
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(BpFlags::ENCRYPTED)
    }

    /// Decode the slot starting at `offset`.
    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let slot = ensure_slice(data, offset, BLKPTR_SIZE)?;
        Ok(Self {
            address: read_le_u64(slot, OFF_ADDRESS)?,
            lsize: read_le_u32(slot, OFF_LSIZE)?,
            psize: read_le_u32(slot, OFF_PSIZE)?,
            birth: Txg(read_le_u64(slot, OFF_BIRTH)?),
            fill: read_le_u64(slot, OFF_FILL)?,
            level: slot[OFF_LEVEL],
            object_type: ObjectType::try_from(slot[OFF_TYPE])?,
            flags: BpFlags(slot[OFF_FLAGS]),
            checksum: read_fixed::<32>(slot, OFF_CHECKSUM)?,
        })
    }

    /// Decode slot number `index` of an indirect block.
    pub fn decode_slot(data: &[u8], index: usize) -> Result<Self, ParseError> {
        let offset = index
            .checked_mul(BLKPTR_SIZE)
            .ok_or(ParseError::IntegerConversion { field: "bp.index" })?;
        Self::decode(data, offset)
    }

    /// Encode into slot number `index` of an indirect block.
    pub fn encode_slot(&self, data: &mut [u8], index: usize) -> Result<(), ParseError> {
        let offset = index
            .checked_mul(BLKPTR_SIZE)
            .ok_or(ParseError::IntegerConversion { field: "bp.index" })?;
        let available = data.len();
        let Some(slot) = data.get_mut(offset..offset.saturating_add(BLKPTR_SIZE)) else {
            return Err(ParseError::InsufficientData {
                needed: BLKPTR_SIZE,
                offset,
                actual: available.saturating_sub(offset),
            });
        };
        slot.fill(0);
        slot[OFF_ADDRESS..OFF_ADDRESS + 8].copy_from_slice(&self.address.to_le_bytes());
        slot[OFF_LSIZE..OFF_LSIZE + 4].copy_from_slice(&self.lsize.to_le_bytes());
        slot[OFF_PSIZE..OFF_PSIZE + 4].copy_from_slice(&self.psize.to_le_bytes());
        slot[OFF_BIRTH..OFF_BIRTH + 8].copy_from_slice(&self.birth.0.to_le_bytes());
        slot[OFF_FILL..OFF_FILL + 8].copy_from_slice(&self.fill.to_le_bytes());
        slot[OFF_LEVEL] = self.level;
        slot[OFF_TYPE] = self.object_type as u8;
        slot[OFF_FLAGS] = self.flags.0;
        slot[OFF_CHECKSUM..OFF_CHECKSUM + 32].copy_from_slice(&self.checksum);
        Ok(())
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hole() {
            return write!(
                f,
                "HOLE [L{} {:?}] size={:#x}L birth={}",
                self.level, self.object_type, self.lsize, self.birth
            );
        }
        write!(
            f,
            "{:#x} [L{} {:?}] size={:#x}L/{:#x}P birth={} fill={}",
            self.address,
            self.level,
            self.object_type,
            self.lsize,
            self.psize,
            self.birth,
            self.fill
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> BlockPointer {
        BlockPointer {
            address: 0x4000,
            lsize: 4096,
            psize: 2048,
            birth: Txg(17),
            fill: 1,
            level: 0,
            object_type: ObjectType::PlainFileContents,
            flags: BpFlags::ENCRYPTED,
            checksum: [0xAB; 32],
        }
    }

    #[test]
    fn zeroed_slot_is_a_hole() {
        let block = vec![0_u8; BLKPTR_SIZE * 4];
        let bp = BlockPointer::decode_slot(&block, 3).expect("decode");
        assert!(bp.is_hole());
        assert_eq!(bp, BlockPointer::default());
    }

    #[test]
    fn slot_encoding_preserves_every_field() {
        let mut block = vec![0xFF_u8; BLKPTR_SIZE * 2];
        let bp = sample();
        bp.encode_slot(&mut block, 1).expect("encode");
        assert_eq!(BlockPointer::decode_slot(&block, 1).expect("decode"), bp);
        // Reserved bytes are zeroed; the neighbouring slot is untouched.
        assert!(block[BLKPTR_SIZE + 35..BLKPTR_SIZE + 48].iter().all(|b| *b == 0));
        assert!(block[..BLKPTR_SIZE].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn encode_past_end_is_rejected() {
        let mut block = vec![0_u8; BLKPTR_SIZE];
        let err = sample().encode_slot(&mut block, 1).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InsufficientData {
                needed: BLKPTR_SIZE,
                actual: 0,
                ..
            }
        ));
    }

    #[test]
    fn unknown_type_byte_fails_decode() {
        let mut block = vec![0_u8; BLKPTR_SIZE];
        block[OFF_TYPE] = 200;
        assert!(matches!(
            BlockPointer::decode(&block, 0),
            Err(ParseError::InvalidField { field: "bp.type", .. })
        ));
    }

    #[test]
    fn redacted_pointer_is_not_a_hole() {
        let bp = BlockPointer {
            flags: BpFlags::REDACTED,
            ..BlockPointer::default()
        };
        assert!(!bp.is_hole());
        assert!(bp.is_redacted());
    }

    #[test]
    fn hole_keeps_shape_and_birth() {
        let hole = BlockPointer::hole(16384, ObjectType::Dnode, 1, Txg(9));
        assert!(hole.is_hole());
        assert_eq!(hole.birth, Txg(9));
        assert!(hole.to_string().starts_with("HOLE [L1 Dnode]"));
    }

    proptest! {
        #[test]
        fn encoded_slot_decodes_to_same_pointer(
            address in any::<u64>(),
            lsize in any::<u32>(),
            birth in any::<u64>(),
            fill in any::<u64>(),
            level in 0_u8..8,
            flags in 0_u8..4,
        ) {
            let bp = BlockPointer {
                address,
                lsize,
                psize: lsize / 2,
                birth: Txg(birth),
                fill,
                level,
                object_type: ObjectType::DirectoryContents,
                flags: BpFlags(flags),
                checksum: [level; 32],
            };
            let mut block = vec![0_u8; BLKPTR_SIZE];
            bp.encode_slot(&mut block, 0).expect("encode");
            prop_assert_eq!(BlockPointer::decode(&block, 0).expect("decode"), bp);
        }
    }
}
