//! Inode block codec.
//!
//! Every inode occupies one block:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0x00 | signature `CTNINOD1` |
//! | 0x08 | `i_blkno` (self) |
//! | 0x10 | `i_flags` |
//! | 0x14 | `i_dyn_features` |
//! | 0x16 | `i_mode` |
//! | 0x18 | `i_clusters` |
//! | 0x1C | `id1` word 0 (journal flags / bitmap used) |
//! | 0x20 | `i_size` |
//! | 0x28 | `id1` word 1 (bitmap total) |
//! | 0x40 | `id2`: chain list, inline data or extent list |

use ctn_types::{
    BlockNumber, INLINE_DATA_FL, INODE_BITMAP_FL, INODE_CHAIN_FL, INODE_ID2_OFFSET,
    INODE_JOURNAL_FL, INODE_SIGNATURE, INODE_SYSTEM_FL, INODE_VALID_FL, JOURNAL_DIRTY_FL,
    ParseError, S_IFDIR, S_IFMT, S_IFREG, read_fixed, read_le_u16, read_le_u32, read_le_u64,
    write_bytes, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Header bytes of every `id2` list before its records begin.
const LIST_HEADER_LEN: usize = 8;
const RECORD_LEN: usize = 16;

/// Bytes available to the `id2` payload after its list header.
#[must_use]
pub fn id2_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(INODE_ID2_OFFSET + LIST_HEADER_LEN)
}

/// Number of 16-byte records (chain or extent) an inode block can hold.
#[must_use]
pub fn record_capacity(block_size: usize) -> usize {
    id2_capacity(block_size) / RECORD_LEN
}

fn to_u16(value: usize, field: &'static str) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRec {
    pub free: u32,
    pub total: u32,
    /// First group descriptor of the chain; zero for an empty chain.
    pub blkno: BlockNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainList {
    pub clusters_per_group: u16,
    pub bits_per_cluster: u16,
    /// `cl_count`: record slots available in the block.
    pub capacity: u16,
    /// Records `0..cl_next_free_rec`.
    pub records: Vec<ChainRec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRec {
    /// Logical cluster offset in the file.
    pub cpos: u32,
    pub clusters: u32,
    pub blkno: BlockNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList {
    pub capacity: u16,
    pub records: Vec<ExtentRec>,
}

impl ExtentList {
    #[must_use]
    pub fn empty(block_size: usize) -> Self {
        Self {
            capacity: u16::try_from(record_capacity(block_size)).unwrap_or(u16::MAX),
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineData {
    /// `id_count`: bytes of inline storage in the block.
    pub capacity: u16,
    /// The first `i_size` bytes of inline storage.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeId1 {
    None,
    Bitmap { used: u32, total: u32 },
    Journal { flags: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodePayload {
    Chains(ChainList),
    Inline(InlineData),
    Extents(ExtentList),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dinode {
    pub blkno: BlockNumber,
    pub flags: u32,
    pub dyn_features: u16,
    pub mode: u16,
    pub clusters: u32,
    pub size: u64,
    pub id1: InodeId1,
    pub id2: InodePayload,
}

impl Dinode {
    /// Parse an inode block. `id1` and `id2` are interpreted according to
    /// `i_flags` and `i_dyn_features`.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let sig: [u8; 8] = read_fixed(block, 0x00)?;
        if sig != INODE_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: INODE_SIGNATURE,
                actual: sig,
            });
        }

        let flags = read_le_u32(block, 0x10)?;
        let dyn_features = read_le_u16(block, 0x14)?;
        let size = read_le_u64(block, 0x20)?;

        let id1 = if flags & INODE_BITMAP_FL != 0 {
            InodeId1::Bitmap {
                used: read_le_u32(block, 0x1C)?,
                total: read_le_u32(block, 0x28)?,
            }
        } else if flags & INODE_JOURNAL_FL != 0 {
            InodeId1::Journal {
                flags: read_le_u32(block, 0x1C)?,
            }
        } else {
            InodeId1::None
        };

        let id2 = if flags & INODE_CHAIN_FL != 0 {
            InodePayload::Chains(parse_chain_list(block)?)
        } else if dyn_features & INLINE_DATA_FL != 0 {
            InodePayload::Inline(parse_inline(block, size)?)
        } else {
            InodePayload::Extents(parse_extent_list(block)?)
        };

        Ok(Self {
            blkno: BlockNumber(read_le_u64(block, 0x08)?),
            flags,
            dyn_features,
            mode: read_le_u16(block, 0x16)?,
            clusters: read_le_u32(block, 0x18)?,
            size,
            id1,
            id2,
        })
    }

    /// Encode into an inode block. The `id2` region is rewritten in full;
    /// header bytes outside the known fields are preserved.
    pub fn encode_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(block, 0x00, &INODE_SIGNATURE)?;
        write_le_u64(block, 0x08, self.blkno.0)?;
        write_le_u32(block, 0x10, self.flags)?;
        write_le_u16(block, 0x14, self.dyn_features)?;
        write_le_u16(block, 0x16, self.mode)?;
        write_le_u32(block, 0x18, self.clusters)?;
        write_le_u64(block, 0x20, self.size)?;
        let (word0, word1) = match self.id1 {
            InodeId1::None => (0, 0),
            InodeId1::Bitmap { used, total } => (used, total),
            InodeId1::Journal { flags } => (flags, 0),
        };
        write_le_u32(block, 0x1C, word0)?;
        write_le_u32(block, 0x28, word1)?;

        if block.len() < INODE_ID2_OFFSET {
            return Err(ParseError::InsufficientData {
                needed: INODE_ID2_OFFSET,
                offset: 0,
                actual: block.len(),
            });
        }
        block[INODE_ID2_OFFSET..].fill(0);
        let base = INODE_ID2_OFFSET;
        match &self.id2 {
            InodePayload::Chains(cl) => {
                if cl.records.len() > usize::from(cl.capacity) {
                    return Err(ParseError::InvalidField {
                        field: "cl_next_free_rec",
                        reason: "more records than cl_count",
                    });
                }
                write_le_u16(block, base, cl.clusters_per_group)?;
                write_le_u16(block, base + 2, cl.bits_per_cluster)?;
                write_le_u16(block, base + 4, cl.capacity)?;
                write_le_u16(block, base + 6, to_u16(cl.records.len(), "cl_next_free_rec")?)?;
                for (i, rec) in cl.records.iter().enumerate() {
                    let at = base + LIST_HEADER_LEN + i * RECORD_LEN;
                    write_le_u32(block, at, rec.free)?;
                    write_le_u32(block, at + 4, rec.total)?;
                    write_le_u64(block, at + 8, rec.blkno.0)?;
                }
            }
            InodePayload::Inline(inline) => {
                if inline.data.len() > usize::from(inline.capacity) {
                    return Err(ParseError::InvalidField {
                        field: "id_count",
                        reason: "inline data exceeds capacity",
                    });
                }
                write_le_u16(block, base, inline.capacity)?;
                write_bytes(block, base + LIST_HEADER_LEN, &inline.data)?;
            }
            InodePayload::Extents(el) => {
                if el.records.len() > usize::from(el.capacity) {
                    return Err(ParseError::InvalidField {
                        field: "l_next_free_rec",
                        reason: "more records than l_count",
                    });
                }
                write_le_u16(block, base, el.capacity)?;
                write_le_u16(block, base + 2, to_u16(el.records.len(), "l_next_free_rec")?)?;
                for (i, rec) in el.records.iter().enumerate() {
                    let at = base + LIST_HEADER_LEN + i * RECORD_LEN;
                    write_le_u32(block, at, rec.cpos)?;
                    write_le_u32(block, at + 4, rec.clusters)?;
                    write_le_u64(block, at + 8, rec.blkno.0)?;
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.flags & INODE_VALID_FL != 0
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.flags & INODE_SYSTEM_FL != 0
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn has_inline_data(&self) -> bool {
        self.dyn_features & INLINE_DATA_FL != 0
    }

    /// Journal inode whose `ij_flags` records unreplayed transactions.
    #[must_use]
    pub fn is_journal_dirty(&self) -> bool {
        matches!(self.id1, InodeId1::Journal { flags } if flags & JOURNAL_DIRTY_FL != 0)
    }

    #[must_use]
    pub fn chain_list(&self) -> Option<&ChainList> {
        match &self.id2 {
            InodePayload::Chains(cl) => Some(cl),
            _ => None,
        }
    }

    #[must_use]
    pub fn chain_list_mut(&mut self) -> Option<&mut ChainList> {
        match &mut self.id2 {
            InodePayload::Chains(cl) => Some(cl),
            _ => None,
        }
    }
}

fn parse_chain_list(block: &[u8]) -> Result<ChainList, ParseError> {
    let base = INODE_ID2_OFFSET;
    let capacity = read_le_u16(block, base + 4)?;
    let next_free = read_le_u16(block, base + 6)?;
    if next_free > capacity {
        return Err(ParseError::InvalidField {
            field: "cl_next_free_rec",
            reason: "exceeds cl_count",
        });
    }
    let records = (0..usize::from(next_free))
        .map(|i| {
            let at = base + LIST_HEADER_LEN + i * RECORD_LEN;
            Ok(ChainRec {
                free: read_le_u32(block, at)?,
                total: read_le_u32(block, at + 4)?,
                blkno: BlockNumber(read_le_u64(block, at + 8)?),
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;
    Ok(ChainList {
        clusters_per_group: read_le_u16(block, base)?,
        bits_per_cluster: read_le_u16(block, base + 2)?,
        capacity,
        records,
    })
}

fn parse_extent_list(block: &[u8]) -> Result<ExtentList, ParseError> {
    let base = INODE_ID2_OFFSET;
    let capacity = read_le_u16(block, base)?;
    let next_free = read_le_u16(block, base + 2)?;
    if next_free > capacity {
        return Err(ParseError::InvalidField {
            field: "l_next_free_rec",
            reason: "exceeds l_count",
        });
    }
    let records = (0..usize::from(next_free))
        .map(|i| {
            let at = base + LIST_HEADER_LEN + i * RECORD_LEN;
            Ok(ExtentRec {
                cpos: read_le_u32(block, at)?,
                clusters: read_le_u32(block, at + 4)?,
                blkno: BlockNumber(read_le_u64(block, at + 8)?),
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;
    Ok(ExtentList { capacity, records })
}

fn parse_inline(block: &[u8], size: u64) -> Result<InlineData, ParseError> {
    let base = INODE_ID2_OFFSET;
    let capacity = read_le_u16(block, base)?;
    let len = usize::try_from(size).map_err(|_| ParseError::IntegerConversion { field: "i_size" })?;
    if len > usize::from(capacity) {
        return Err(ParseError::InvalidField {
            field: "i_size",
            reason: "inline size exceeds id_count",
        });
    }
    let data = ctn_types::ensure_slice(block, base + LIST_HEADER_LEN, len)?.to_vec();
    Ok(InlineData { capacity, data })
}
