//! Inline data: small files and directories stored inside their inode.
//!
//! Enabling only flips the incompat bit. Disabling must first move every
//! inline inode out to a cluster of its own, since a filesystem without the
//! feature cannot read inline inodes.

use ctn_alloc::{convert_inline_data_to_extents, free_clusters};
use ctn_core::{Feature, FeatureOutcome, InProgress, OpContext};
use ctn_error::{CtnError, Result};
use ctn_ondisk::FsImage;
use ctn_types::{BlockNumber, Cx, IncompatFeatures, OpenFlags, TunefsFlags};
use tracing::{debug, info, warn};

const EXPANDING: InProgress = InProgress::Tunefs(TunefsFlags::INLINE_EXPAND);

/// Inline inodes found by [`find_inline_data`] and the room to expand them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineScan {
    pub inodes: Vec<BlockNumber>,
    pub free_clusters: u32,
}

impl InlineScan {
    /// One cluster per inode. Empty inodes need none, but are counted anyway.
    #[must_use]
    pub fn clusters_needed(&self) -> u32 {
        u32::try_from(self.inodes.len()).unwrap_or(u32::MAX)
    }
}

/// Collect regular files and directories that store their data inline.
pub fn find_inline_data(cx: &Cx, image: &FsImage) -> Result<InlineScan> {
    let mut inodes = Vec::new();
    image.foreach_inode(cx, |inode| {
        if (inode.is_regular() || inode.is_dir()) && inode.has_inline_data() {
            inodes.push(inode.blkno);
        }
        Ok(())
    })?;
    let free_clusters = free_clusters(cx, image)?;
    Ok(InlineScan {
        inodes,
        free_clusters,
    })
}

/// Convert `inodes` in order. Stops at the first failure; inodes already
/// converted stay converted.
pub fn expand_inline_data(cx: &Cx, image: &FsImage, inodes: &[BlockNumber]) -> Result<()> {
    for &blkno in inodes {
        convert_inline_data_to_extents(cx, image, blkno).map_err(|err| CtnError::Conversion {
            inode: blkno.0,
            source: Box::new(err),
        })?;
        debug!(inode = blkno.0, "inline data expanded");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InlineData;

impl InlineData {
    fn device(ctx: &OpContext<'_>) -> Result<String> {
        Ok(ctx.image()?.device_name().to_owned())
    }
}

impl Feature for InlineData {
    fn name(&self) -> &str {
        "inline-data"
    }

    fn incompat_bit(&self) -> IncompatFeatures {
        IncompatFeatures::INLINE_DATA
    }

    fn open_flags(&self) -> OpenFlags {
        OpenFlags::RW | OpenFlags::ALLOCATION
    }

    fn enable(&mut self, ctx: &mut OpContext<'_>) -> Result<FeatureOutcome> {
        if ctx.has_feature(IncompatFeatures::INLINE_DATA)? {
            info!("The inline data feature is already enabled; nothing to enable");
            return Ok(FeatureOutcome::NothingToDo);
        }
        let device = Self::device(ctx)?;
        if !ctx.console_mut().confirm(format_args!(
            "Enable the inline data feature on device \"{device}\"?"
        ))? {
            return Ok(FeatureOutcome::Declined);
        }

        ctx.image_mut()?
            .superblock_mut()
            .feature_incompat
            .insert(IncompatFeatures::INLINE_DATA);
        ctx.write_super()?;
        Ok(FeatureOutcome::Changed)
    }

    fn disable(&mut self, ctx: &mut OpContext<'_>) -> Result<FeatureOutcome> {
        if !ctx.has_feature(IncompatFeatures::INLINE_DATA)? {
            info!("The inline data feature is not enabled; nothing to disable");
            return Ok(FeatureOutcome::NothingToDo);
        }
        let device = Self::device(ctx)?;
        if !ctx.console_mut().confirm(format_args!(
            "Disable the inline data feature on device \"{device}\"?"
        ))? {
            return Ok(FeatureOutcome::Declined);
        }

        let scan = find_inline_data(ctx.cx(), ctx.image()?)?;
        let needed = scan.clusters_needed();
        info!(
            device = %device,
            "We have {} clusters free, and need {needed} clusters to expand all inline data",
            scan.free_clusters
        );
        if scan.free_clusters < needed {
            return Err(CtnError::NoSpace {
                needed: u64::from(needed),
                free: u64::from(scan.free_clusters),
            });
        }

        ctx.set_in_progress(EXPANDING)?;
        if let Err(err) = expand_inline_data(ctx.cx(), ctx.image()?, &scan.inodes) {
            // Converted inodes are complete; the marker must not fence the
            // next open.
            if let Err(clear_err) = ctx.clear_in_progress(EXPANDING) {
                warn!(device = %device, error = %clear_err, "clearing in-progress marker");
            }
            return Err(err);
        }

        ctx.image_mut()?
            .superblock_mut()
            .feature_incompat
            .remove(IncompatFeatures::INLINE_DATA);
        ctx.clear_in_progress(EXPANDING)?;
        Ok(FeatureOutcome::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctn_block::MemByteDevice;
    use ctn_ondisk::{FileKind, ImageBuilder, OpenMode};
    use std::sync::Arc;

    fn open(builder: ImageBuilder) -> FsImage {
        let built = builder.build().expect("build");
        let cx = Cx::for_testing();
        FsImage::open(
            &cx,
            "/dev/mem0",
            Arc::new(MemByteDevice::from_bytes(built.bytes)),
            OpenMode::ReadWrite,
        )
        .expect("open")
    }

    #[test]
    fn scan_collects_only_files_and_directories() {
        let image = open(
            ImageBuilder::new()
                .file(FileKind::Regular, b"hello")
                .file(FileKind::Symlink, b"target")
                .file(FileKind::Directory, b"entries")
                .extent_file(2),
        );
        let scan = find_inline_data(&Cx::for_testing(), &image).expect("scan");
        assert_eq!(scan.inodes.len(), 2);
        assert_eq!(scan.clusters_needed(), 2);
        assert!(scan.free_clusters > 0);
    }

    #[test]
    fn expansion_failure_names_the_inode() {
        let image = open(ImageBuilder::new().file(FileKind::Regular, b"x"));
        let bogus = BlockNumber(u64::from(u32::MAX));
        let err = expand_inline_data(&Cx::for_testing(), &image, &[bogus]).unwrap_err();
        match err {
            CtnError::Conversion { inode, .. } => assert_eq!(inode, bogus.0),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
