#![forbid(unsafe_code)]
//! On-disk format for the cluster filesystem.
//!
//! The codec modules (`superblock`, `inode`, `group`) are pure: they parse
//! byte slices into typed structures and encode them back, preserving bytes
//! they do not interpret. [`FsImage`] adds device access on top: it owns the
//! parsed superblock and the session's block cache and maps codec failures to
//! `CtnError` with the offending block attached.

pub mod builder;
pub mod group;
pub mod image;
pub mod inode;
pub mod superblock;

pub use builder::{BuiltImage, FileKind, ImageBuilder};
pub use group::GroupDesc;
pub use image::{FsImage, OpenMode, SystemInode};
pub use inode::{ChainList, ChainRec, Dinode, ExtentList, ExtentRec, InlineData, InodeId1, InodePayload};
pub use superblock::Superblock;

use ctn_error::CtnError;
use ctn_types::{BlockNumber, ParseError};

/// Malformed live metadata at `block`.
pub(crate) fn corruption(block: BlockNumber, err: &ParseError) -> CtnError {
    CtnError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}
