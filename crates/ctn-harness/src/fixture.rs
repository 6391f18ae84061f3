//! Fixture images on disk: option parsing for `mkimage` and a JSON summary
//! of an existing image for `inspect`.

use anyhow::{Context, Result, bail};
use ctn_block::FileByteDevice;
use ctn_ondisk::{FileKind, FsImage, ImageBuilder, OpenMode, Superblock};
use ctn_types::{Cx, IncompatFeatures};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Builder settings accepted on the `mkimage` command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MkimageOptions {
    pub local: bool,
    pub stack: Option<String>,
    pub slots: Option<u16>,
    pub dirty_slots: Vec<u16>,
    pub inline_files: usize,
    pub inline_dirs: usize,
    pub no_inline_data: bool,
}

impl MkimageOptions {
    pub fn parse(args: &[String]) -> Result<Self> {
        let mut opts = Self::default();
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .with_context(|| format!("{name} requires a value"))
                    .map(String::as_str)
            };
            match arg.as_str() {
                "--local" => opts.local = true,
                "--no-inline-data" => opts.no_inline_data = true,
                "--stack" => opts.stack = Some(value("--stack")?.to_owned()),
                "--slots" => opts.slots = Some(value("--slots")?.parse().context("--slots")?),
                "--dirty-journal" => opts
                    .dirty_slots
                    .push(value("--dirty-journal")?.parse().context("--dirty-journal")?),
                "--inline-files" => {
                    opts.inline_files = value("--inline-files")?.parse().context("--inline-files")?;
                }
                "--inline-dirs" => {
                    opts.inline_dirs = value("--inline-dirs")?.parse().context("--inline-dirs")?;
                }
                other => bail!("unknown mkimage option: {other}"),
            }
        }
        Ok(opts)
    }

    #[must_use]
    pub fn builder(&self) -> ImageBuilder {
        let mut builder = ImageBuilder::new();
        if self.local {
            builder = builder.local();
        }
        if let Some(stack) = &self.stack {
            builder = builder.cluster_stack(stack);
        }
        if let Some(slots) = self.slots {
            builder = builder.slots(slots, 4);
        }
        for &slot in &self.dirty_slots {
            builder = builder.dirty_journal(slot);
        }
        if self.no_inline_data {
            builder = builder.without_incompat(IncompatFeatures::INLINE_DATA);
        }
        for idx in 0..self.inline_files {
            builder = builder.file(FileKind::Regular, format!("inline file {idx}\n").as_bytes());
        }
        for idx in 0..self.inline_dirs {
            builder = builder.file(FileKind::Directory, format!("entry-{idx}").as_bytes());
        }
        builder
    }
}

/// Build the image described by `opts` and write it to `path`.
pub fn write_image(path: &Path, opts: &MkimageOptions) -> Result<ImageReport> {
    let built = opts.builder().build().context("building image")?;
    std::fs::write(path, &built.bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    inspect(path)
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub superblock: Superblock,
    pub incompat: Vec<&'static str>,
    pub free_clusters: u32,
    pub inline_inodes: usize,
}

/// Summarize the image at `path` without modifying it.
pub fn inspect(path: &Path) -> Result<ImageReport> {
    let cx = Cx::for_request();
    let raw = FileByteDevice::open(path, false)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let display = path.display().to_string();
    let image = FsImage::open(&cx, &display, Arc::new(raw), OpenMode::ReadOnly)
        .with_context(|| format!("failed to read superblock of {display}"))?;

    let mut inline_inodes = 0;
    image.foreach_inode(&cx, |inode| {
        if inode.has_inline_data() {
            inline_inodes += 1;
        }
        Ok(())
    })?;
    let free_clusters = ctn_alloc::free_clusters(&cx, &image)?;
    let sb = image.superblock().clone();
    Ok(ImageReport {
        incompat: sb.feature_incompat.describe(),
        superblock: sb,
        free_clusters,
        inline_inodes,
    })
}
