//! Chain allocator group descriptor codec.

use ctn_types::{
    BlockNumber, ChainIndex, ClusterNumber, GROUP_BITMAP_OFFSET, GROUP_DESC_SIGNATURE, ParseError,
    ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64, write_bytes, write_le_u16,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub blkno: BlockNumber,
    /// Allocator inode this group is linked from.
    pub parent_dinode: BlockNumber,
    /// Next group on the same chain; zero ends the chain.
    pub next_group: BlockNumber,
    pub start_cluster: ClusterNumber,
    pub chain: ChainIndex,
    /// `bg_size`: bitmap capacity in bytes.
    pub size: u16,
    /// `bg_bits`: bits the group tracks.
    pub bits: u16,
    pub free_bits_count: u16,
    /// Bitmap bytes; `len() == size`.
    pub bitmap: Vec<u8>,
}

impl GroupDesc {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let sig: [u8; 8] = read_fixed(block, 0x00)?;
        if sig != GROUP_DESC_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: GROUP_DESC_SIGNATURE,
                actual: sig,
            });
        }
        let size = read_le_u16(block, 0x26)?;
        if usize::from(size) > block.len().saturating_sub(GROUP_BITMAP_OFFSET) {
            return Err(ParseError::InvalidField {
                field: "bg_size",
                reason: "bitmap does not fit in the descriptor block",
            });
        }
        Ok(Self {
            blkno: BlockNumber(read_le_u64(block, 0x08)?),
            parent_dinode: BlockNumber(read_le_u64(block, 0x10)?),
            next_group: BlockNumber(read_le_u64(block, 0x18)?),
            start_cluster: ClusterNumber(read_le_u32(block, 0x20)?),
            chain: ChainIndex(read_le_u16(block, 0x24)?),
            size,
            bits: read_le_u16(block, 0x28)?,
            free_bits_count: read_le_u16(block, 0x2A)?,
            bitmap: ensure_slice(block, GROUP_BITMAP_OFFSET, usize::from(size))?.to_vec(),
        })
    }

    pub fn encode_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if self.bitmap.len() != usize::from(self.size) {
            return Err(ParseError::InvalidField {
                field: "bg_bitmap",
                reason: "bitmap length differs from bg_size",
            });
        }
        write_bytes(block, 0x00, &GROUP_DESC_SIGNATURE)?;
        write_le_u64(block, 0x08, self.blkno.0)?;
        write_le_u64(block, 0x10, self.parent_dinode.0)?;
        write_le_u64(block, 0x18, self.next_group.0)?;
        write_le_u32(block, 0x20, self.start_cluster.0)?;
        write_le_u16(block, 0x24, self.chain.0)?;
        write_le_u16(block, 0x26, self.size)?;
        write_le_u16(block, 0x28, self.bits)?;
        write_le_u16(block, 0x2A, self.free_bits_count)?;
        write_bytes(block, GROUP_BITMAP_OFFSET, &self.bitmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_desc_round_trips() {
        let gd = GroupDesc {
            blkno: BlockNumber(64),
            parent_dinode: BlockNumber(2),
            next_group: BlockNumber(128),
            start_cluster: ClusterNumber(64),
            chain: ChainIndex(1),
            size: 8,
            bits: 64,
            free_bits_count: 63,
            bitmap: vec![0x01, 0, 0, 0, 0, 0, 0, 0],
        };
        let mut block = vec![0_u8; 1024];
        gd.encode_into(&mut block).expect("encode");
        assert_eq!(GroupDesc::parse(&block).expect("parse"), gd);
    }

    #[test]
    fn oversized_bitmap_is_rejected() {
        let mut block = vec![0_u8; 128];
        block[..8].copy_from_slice(&GROUP_DESC_SIGNATURE);
        block[0x26..0x28].copy_from_slice(&200_u16.to_le_bytes());
        assert!(matches!(
            GroupDesc::parse(&block),
            Err(ParseError::InvalidField { field: "bg_size", .. })
        ));
    }
}
