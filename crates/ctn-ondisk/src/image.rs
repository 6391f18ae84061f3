//! Filesystem image access: superblock ownership, metadata block I/O, and
//! inode iteration on top of a [`ByteDevice`].

use crate::{Dinode, GroupDesc, Superblock, corruption};
use ctn_block::{
    BlockBuf, BlockCache, BlockDevice, ByteBlockDevice, ByteDevice, read_superblock_region,
    write_superblock_region,
};
use ctn_error::{CtnError, Result};
use ctn_types::{BlockNumber, ClusterNumber, Cx, SUPERBLOCK_SIZE, SlotNumber};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// System inodes reachable from the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemInode {
    GlobalBitmap,
    Journal,
}

type CachedDevice = BlockCache<ByteBlockDevice<Arc<dyn ByteDevice>>>;

pub struct FsImage {
    device_name: String,
    mode: OpenMode,
    raw: Arc<dyn ByteDevice>,
    blocks: CachedDevice,
    sb_region: Box<[u8; SUPERBLOCK_SIZE]>,
    superblock: Superblock,
}

impl std::fmt::Debug for FsImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsImage")
            .field("device_name", &self.device_name)
            .field("mode", &self.mode)
            .field("superblock", &self.superblock)
            .finish_non_exhaustive()
    }
}

impl FsImage {
    /// Parse and sanity-check the superblock of `device`.
    pub fn open(
        cx: &Cx,
        device_name: impl Into<String>,
        device: Arc<dyn ByteDevice>,
        mode: OpenMode,
    ) -> Result<Self> {
        let device_name = device_name.into();
        let region = read_superblock_region(cx, device.as_ref())?;
        let superblock = Superblock::parse_region(&region)
            .map_err(|err| CtnError::Format(format!("{device_name}: {err}")))?;
        let blocks = BlockCache::new(ByteBlockDevice::new(
            Arc::clone(&device),
            superblock.block_size(),
        )?);
        if blocks.block_count() < superblock.blocks_count {
            return Err(CtnError::Format(format!(
                "{device_name}: device holds {} blocks, superblock claims {}",
                blocks.block_count(),
                superblock.blocks_count
            )));
        }
        debug!(
            device = %device_name,
            ?mode,
            block_size = superblock.block_size(),
            clusters = superblock.clusters_count,
            "opened filesystem image"
        );
        Ok(Self {
            device_name,
            mode,
            raw: device,
            blocks,
            sb_region: Box::new(region),
            superblock,
        })
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.mode == OpenMode::ReadWrite
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// In-memory superblock; changes reach disk with [`FsImage::write_super`].
    pub fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        usize::try_from(self.superblock.block_size()).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn cluster_to_block(&self, cluster: ClusterNumber) -> BlockNumber {
        BlockNumber(u64::from(cluster.0) << self.cluster_shift())
    }

    #[must_use]
    pub fn block_to_cluster(&self, block: BlockNumber) -> ClusterNumber {
        ClusterNumber(u32::try_from(block.0 >> self.cluster_shift()).unwrap_or(u32::MAX))
    }

    fn cluster_shift(&self) -> u32 {
        self.superblock.cluster_size_bits - self.superblock.block_size_bits
    }

    /// Turn on the session I/O cache.
    pub fn init_cache(&self, capacity_blocks: usize) -> Result<()> {
        self.blocks.enable(capacity_blocks)?;
        trace!(device = %self.device_name, capacity_blocks, "io cache enabled");
        Ok(())
    }

    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.blocks.is_enabled()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(CtnError::ReadOnly)
        }
    }

    // ── Raw blocks ───────────────────────────────────────────────────────

    pub fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        self.blocks.read_block(cx, block)
    }

    pub fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.blocks.write_block(cx, block, data)
    }

    // ── Inodes and group descriptors ─────────────────────────────────────

    pub fn read_inode(&self, cx: &Cx, blkno: BlockNumber) -> Result<Dinode> {
        let buf = self.read_block(cx, blkno)?;
        let inode = Dinode::parse(buf.as_slice()).map_err(|err| corruption(blkno, &err))?;
        if inode.blkno != blkno {
            return Err(CtnError::Corruption {
                block: blkno.0,
                detail: format!("inode claims to live at block {}", inode.blkno),
            });
        }
        Ok(inode)
    }

    pub fn write_inode(&self, cx: &Cx, inode: &Dinode) -> Result<()> {
        self.ensure_writable()?;
        let mut buf = self.read_block(cx, inode.blkno)?;
        inode
            .encode_into(buf.as_mut_slice())
            .map_err(|err| corruption(inode.blkno, &err))?;
        self.write_block(cx, inode.blkno, buf.as_slice())
    }

    pub fn read_group_desc(&self, cx: &Cx, blkno: BlockNumber) -> Result<GroupDesc> {
        let buf = self.read_block(cx, blkno)?;
        let gd = GroupDesc::parse(buf.as_slice()).map_err(|err| corruption(blkno, &err))?;
        if gd.blkno != blkno {
            return Err(CtnError::Corruption {
                block: blkno.0,
                detail: format!("group descriptor claims to live at block {}", gd.blkno),
            });
        }
        Ok(gd)
    }

    pub fn write_group_desc(&self, cx: &Cx, gd: &GroupDesc) -> Result<()> {
        self.ensure_writable()?;
        let mut buf = self.read_block(cx, gd.blkno)?;
        gd.encode_into(buf.as_mut_slice())
            .map_err(|err| corruption(gd.blkno, &err))?;
        self.write_block(cx, gd.blkno, buf.as_slice())
    }

    // ── Superblock ───────────────────────────────────────────────────────

    /// Write the in-memory superblock to its primary location.
    pub fn write_super(&mut self, cx: &Cx) -> Result<()> {
        self.ensure_writable()?;
        self.superblock
            .encode_into(self.sb_region.as_mut_slice())
            .map_err(|err| CtnError::Format(format!("{}: {err}", self.device_name)))?;
        write_superblock_region(cx, self.raw.as_ref(), &self.sb_region)?;
        debug!(
            device = %self.device_name,
            incompat = %self.superblock.feature_incompat,
            tunefs_flag = %self.superblock.tunefs_flag,
            "superblock written"
        );
        Ok(())
    }

    /// Block number of a system inode. `slot` is ignored for global inodes.
    pub fn lookup_system_inode(&self, kind: SystemInode, slot: SlotNumber) -> Result<BlockNumber> {
        let blkno = match kind {
            SystemInode::GlobalBitmap => self.superblock.global_bitmap_blkno,
            SystemInode::Journal => self
                .superblock
                .journal_blknos
                .get(usize::from(slot.0))
                .copied()
                .ok_or_else(|| {
                    CtnError::Internal(format!(
                        "slot {slot} is out of range (max_slots={})",
                        self.superblock.max_slots
                    ))
                })?,
        };
        if blkno.is_null() {
            return Err(CtnError::Format(format!(
                "{}: no {kind:?} system inode for slot {slot}",
                self.device_name
            )));
        }
        Ok(blkno)
    }

    /// Call `visit` for every valid, non-system inode in the inode table.
    ///
    /// Empty table entries (no inode signature) are skipped.
    pub fn foreach_inode<F>(&self, cx: &Cx, mut visit: F) -> Result<()>
    where
        F: FnMut(&Dinode) -> Result<()>,
    {
        let start = self.superblock.inode_table_blkno.0;
        for blkno in (start..start + u64::from(self.superblock.inode_count)).map(BlockNumber) {
            cx.checkpoint().map_err(|_| CtnError::Cancelled)?;
            let buf = self.read_block(cx, blkno)?;
            if buf.as_slice().iter().take(8).all(|b| *b == 0) {
                continue;
            }
            let inode = self.read_inode(cx, blkno)?;
            if !inode.is_valid() || inode.is_system() {
                continue;
            }
            visit(&inode)?;
        }
        Ok(())
    }

    pub fn sync(&self, cx: &Cx) -> Result<()> {
        self.blocks.sync(cx)
    }

    /// Flush a writable image and release it.
    pub fn close(self, cx: &Cx) -> Result<()> {
        if self.is_writable() {
            self.sync(cx)?;
        }
        let stats = self.blocks.stats();
        debug!(
            device = %self.device_name,
            cache_hits = stats.hits,
            cache_misses = stats.misses,
            "closed filesystem image"
        );
        Ok(())
    }
}
