#![forbid(unsafe_code)]
//! Shared vocabulary for the clustune workspace.
//!
//! Unit-carrying newtypes for block, cluster, slot and chain addressing, the
//! constants that describe the on-disk layout of the cluster filesystem, the
//! byte-level parse helpers used by `ctn-ondisk`, and the cooperative
//! cancellation context [`Cx`] threaded through every I/O path.

mod cx;
mod features;

pub use cx::{Cx, Stopped};
pub use features::{
    CompatFeatures, IncompatFeatures, OpenFlags, RoCompatFeatures, TunefsFlags, describe_flags,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const SUPER_MAGIC: [u8; 8] = *b"CTNFSV01";
pub const INODE_SIGNATURE: [u8; 8] = *b"CTNINOD1";
pub const GROUP_DESC_SIGNATURE: [u8; 8] = *b"CTNGRUP1";

/// Highest slot count the superblock journal table can describe.
pub const MAX_SLOTS: u16 = 32;
/// Length of the NUL-padded cluster stack name in the superblock.
pub const STACK_NAME_LEN: usize = 16;
pub const LABEL_LEN: usize = 32;

/// Smallest supported block size; the superblock region must fit in one block
/// past the first.
pub const MIN_BLOCK_SIZE_BITS: u32 = 10;
pub const MAX_BLOCK_SIZE_BITS: u32 = 16;

/// Byte offset of the type-specific payload (`id2`) inside an inode block.
pub const INODE_ID2_OFFSET: usize = 0x40;
/// Byte offset of the bitmap inside a group descriptor block.
pub const GROUP_BITMAP_OFFSET: usize = 0x40;

// ── Inode flags ─────────────────────────────────────────────────────────────

pub const INODE_VALID_FL: u32 = 0x0000_0001;
pub const INODE_SYSTEM_FL: u32 = 0x0000_0010;
pub const INODE_BITMAP_FL: u32 = 0x0000_0080;
pub const INODE_JOURNAL_FL: u32 = 0x0000_0100;
pub const INODE_CHAIN_FL: u32 = 0x0000_0400;

/// `i_dyn_features`: file data lives inside the inode block.
pub const INLINE_DATA_FL: u16 = 0x0001;

/// Journal `ij_flags`: the journal holds transactions that were never replayed.
pub const JOURNAL_DIRTY_FL: u32 = 0x0000_0001;

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFLNK: u16 = 0o120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterNumber(pub u32);

/// Node slot index; each slot owns one journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotNumber(pub u16);

/// Index of a chain record inside a chain allocator inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainIndex(pub u16);

impl BlockNumber {
    /// The zero block never holds metadata; a zero link terminates chains.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClusterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
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
    #[error("invalid magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: [u8; 8], actual: [u8; 8] },
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
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
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

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
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

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// Copy `text` into a NUL-padded fixed field, truncating at `N` bytes.
#[must_use]
pub fn nul_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [0_u8; N];
    let bytes = text.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}
