//! Superblock codec (1024 bytes at byte offset 1024).

use ctn_types::{
    BlockNumber, CompatFeatures, IncompatFeatures, LABEL_LEN, MAX_BLOCK_SIZE_BITS, MAX_SLOTS,
    MIN_BLOCK_SIZE_BITS, ParseError, RoCompatFeatures, STACK_NAME_LEN, SUPER_MAGIC,
    SUPERBLOCK_SIZE, TunefsFlags, nul_padded, read_fixed, read_le_u16, read_le_u32, read_le_u64,
    trim_nul_padded, write_bytes, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

const MAX_CLUSTER_SIZE_BITS: u32 = 20;
const JOURNAL_TABLE_OFFSET: usize = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    // ── Geometry ─────────────────────────────────────────────────────────
    pub rev_major: u16,
    pub rev_minor: u16,
    pub block_size_bits: u32,
    pub cluster_size_bits: u32,
    pub blocks_count: u64,
    pub clusters_count: u32,
    pub max_slots: u16,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,
    pub tunefs_flag: TunefsFlags,

    // ── Identity ─────────────────────────────────────────────────────────
    pub cluster_stack: String,
    pub label: String,

    // ── System inode locations ───────────────────────────────────────────
    pub global_bitmap_blkno: BlockNumber,
    pub root_blkno: BlockNumber,
    pub inode_table_blkno: BlockNumber,
    pub inode_count: u32,
    /// One journal inode per slot; `len() == max_slots`.
    pub journal_blknos: Vec<BlockNumber>,
}

impl Superblock {
    /// Parse a superblock from its 1024-byte region.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic: [u8; 8] = read_fixed(region, 0x00)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPER_MAGIC,
                actual: magic,
            });
        }

        let max_slots = read_le_u16(region, 0x14)?;
        if max_slots == 0 || max_slots > MAX_SLOTS {
            return Err(ParseError::InvalidField {
                field: "s_max_slots",
                reason: "must be between 1 and 32",
            });
        }
        let journal_blknos = (0..usize::from(max_slots))
            .map(|slot| read_le_u64(region, JOURNAL_TABLE_OFFSET + slot * 8).map(BlockNumber))
            .collect::<Result<Vec<_>, _>>()?;

        let stack: [u8; STACK_NAME_LEN] = read_fixed(region, 0x30)?;
        let label: [u8; LABEL_LEN] = read_fixed(region, 0x60)?;

        let sb = Self {
            rev_major: read_le_u16(region, 0x08)?,
            rev_minor: read_le_u16(region, 0x0A)?,
            block_size_bits: read_le_u32(region, 0x0C)?,
            cluster_size_bits: read_le_u32(region, 0x10)?,
            max_slots,
            tunefs_flag: TunefsFlags(read_le_u16(region, 0x16)?),
            blocks_count: read_le_u64(region, 0x18)?,
            clusters_count: read_le_u32(region, 0x20)?,
            feature_compat: CompatFeatures(read_le_u32(region, 0x24)?),
            feature_incompat: IncompatFeatures(read_le_u32(region, 0x28)?),
            feature_ro_compat: RoCompatFeatures(read_le_u32(region, 0x2C)?),
            cluster_stack: trim_nul_padded(&stack),
            global_bitmap_blkno: BlockNumber(read_le_u64(region, 0x40)?),
            root_blkno: BlockNumber(read_le_u64(region, 0x48)?),
            inode_table_blkno: BlockNumber(read_le_u64(region, 0x50)?),
            inode_count: read_le_u32(region, 0x58)?,
            label: trim_nul_padded(&label),
            journal_blknos,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    /// Encode into `region`, leaving bytes outside the known fields alone.
    pub fn encode_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if self.journal_blknos.len() != usize::from(self.max_slots) {
            return Err(ParseError::InvalidField {
                field: "s_journal_blknos",
                reason: "one journal per slot required",
            });
        }
        write_bytes(region, 0x00, &SUPER_MAGIC)?;
        write_le_u16(region, 0x08, self.rev_major)?;
        write_le_u16(region, 0x0A, self.rev_minor)?;
        write_le_u32(region, 0x0C, self.block_size_bits)?;
        write_le_u32(region, 0x10, self.cluster_size_bits)?;
        write_le_u16(region, 0x14, self.max_slots)?;
        write_le_u16(region, 0x16, self.tunefs_flag.bits())?;
        write_le_u64(region, 0x18, self.blocks_count)?;
        write_le_u32(region, 0x20, self.clusters_count)?;
        write_le_u32(region, 0x24, self.feature_compat.bits())?;
        write_le_u32(region, 0x28, self.feature_incompat.bits())?;
        write_le_u32(region, 0x2C, self.feature_ro_compat.bits())?;
        write_bytes(region, 0x30, &nul_padded::<STACK_NAME_LEN>(&self.cluster_stack))?;
        write_le_u64(region, 0x40, self.global_bitmap_blkno.0)?;
        write_le_u64(region, 0x48, self.root_blkno.0)?;
        write_le_u64(region, 0x50, self.inode_table_blkno.0)?;
        write_le_u32(region, 0x58, self.inode_count)?;
        write_bytes(region, 0x60, &nul_padded::<LABEL_LEN>(&self.label))?;
        for (slot, blkno) in self.journal_blknos.iter().enumerate() {
            write_le_u64(region, JOURNAL_TABLE_OFFSET + slot * 8, blkno.0)?;
        }
        Ok(())
    }

    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if !(MIN_BLOCK_SIZE_BITS..=MAX_BLOCK_SIZE_BITS).contains(&self.block_size_bits) {
            return Err(ParseError::InvalidField {
                field: "s_blocksize_bits",
                reason: "block size must be 1 KiB to 64 KiB",
            });
        }
        if self.cluster_size_bits < self.block_size_bits
            || self.cluster_size_bits > MAX_CLUSTER_SIZE_BITS
        {
            return Err(ParseError::InvalidField {
                field: "s_clustersize_bits",
                reason: "cluster size must be block size to 1 MiB",
            });
        }
        if self.clusters_count == 0 {
            return Err(ParseError::InvalidField {
                field: "s_clusters_count",
                reason: "cannot be zero",
            });
        }
        let needed_blocks =
            u64::from(self.clusters_count) << (self.cluster_size_bits - self.block_size_bits);
        if needed_blocks > self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_clusters_count",
                reason: "clusters exceed blocks_count",
            });
        }
        if self.global_bitmap_blkno.is_null() || self.inode_table_blkno.is_null() {
            return Err(ParseError::InvalidField {
                field: "s_system_dir_blkno",
                reason: "system inode locations must be set",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        1_u32 << self.block_size_bits
    }

    #[must_use]
    pub fn cluster_size(&self) -> u32 {
        1_u32 << self.cluster_size_bits
    }

    #[must_use]
    pub fn blocks_per_cluster(&self) -> u32 {
        1_u32 << (self.cluster_size_bits - self.block_size_bits)
    }

    /// Mounted by a single node without a cluster stack.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.feature_incompat.contains(IncompatFeatures::LOCAL_MOUNT)
    }

    #[must_use]
    pub fn is_clustered(&self) -> bool {
        !self.is_local()
    }

    #[must_use]
    pub fn has_incompat(&self, feature: IncompatFeatures) -> bool {
        self.feature_incompat.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            rev_major: 0,
            rev_minor: 90,
            block_size_bits: 12,
            cluster_size_bits: 12,
            blocks_count: 1024,
            clusters_count: 1024,
            max_slots: 2,
            feature_compat: CompatFeatures::NONE,
            feature_incompat: IncompatFeatures::SPARSE_ALLOC | IncompatFeatures::INLINE_DATA,
            feature_ro_compat: RoCompatFeatures::UNWRITTEN,
            tunefs_flag: TunefsFlags::NONE,
            cluster_stack: "o2cb".to_owned(),
            label: "data01".to_owned(),
            global_bitmap_blkno: BlockNumber(1),
            root_blkno: BlockNumber(4),
            inode_table_blkno: BlockNumber(1),
            inode_count: 32,
            journal_blknos: vec![BlockNumber(2), BlockNumber(3)],
        }
    }

    #[test]
    fn encode_then_parse_preserves_fields_and_unknown_bytes() {
        let sb = sample();
        let mut region = vec![0xEE_u8; SUPERBLOCK_SIZE];
        sb.encode_into(&mut region).expect("encode");
        assert_eq!(region[0x3F0], 0xEE);

        let parsed = Superblock::parse_region(&region).expect("parse");
        assert_eq!(parsed, sb);
        assert_eq!(parsed.block_size(), 4096);
        assert_eq!(parsed.blocks_per_cluster(), 1);
        assert!(parsed.is_clustered());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        sample().encode_into(&mut region).expect("encode");
        region[0] = b'X';
        assert!(matches!(
            Superblock::parse_region(&region),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn geometry_rejects_cluster_smaller_than_block() {
        let mut sb = sample();
        sb.cluster_size_bits = 11;
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "s_clustersize_bits",
                ..
            })
        ));
    }

    #[test]
    fn zero_slots_is_rejected() {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        sample().encode_into(&mut region).expect("encode");
        region[0x14] = 0;
        region[0x15] = 0;
        assert!(Superblock::parse_region(&region).is_err());
    }

    #[test]
    fn superblock_serializes_for_inspection() {
        let json = serde_json::to_string(&sample()).expect("json");
        assert!(json.contains("\"cluster_stack\":\"o2cb\""));
    }
}
