//! Fixture image builder.
//!
//! Lays out a small but complete filesystem: superblock, inode table, global
//! bitmap with chained groups, one journal per slot, a root directory and any
//! number of user files. Tests and the `ctn-harness mkimage` command use it to
//! produce images whose allocator accounting is consistent by construction.

use crate::inode::{id2_capacity, record_capacity};
use crate::{
    ChainList, ChainRec, Dinode, ExtentList, ExtentRec, GroupDesc, InlineData, InodeId1,
    InodePayload, Superblock,
};
use ctn_error::{CtnError, Result};
use ctn_types::{
    BlockNumber, ChainIndex, ClusterNumber, CompatFeatures, GROUP_BITMAP_OFFSET, INLINE_DATA_FL,
    INODE_BITMAP_FL, INODE_CHAIN_FL, INODE_JOURNAL_FL, INODE_SYSTEM_FL, INODE_VALID_FL,
    IncompatFeatures, JOURNAL_DIRTY_FL, MAX_SLOTS, RoCompatFeatures, S_IFDIR, S_IFLNK, S_IFREG,
    SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, TunefsFlags,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    fn mode(self) -> u16 {
        match self {
            Self::Regular => S_IFREG | 0o644,
            Self::Directory => S_IFDIR | 0o755,
            Self::Symlink => S_IFLNK | 0o777,
        }
    }
}

#[derive(Debug, Clone)]
enum FileContent {
    Inline(Vec<u8>),
    Extents(u32),
}

#[derive(Debug, Clone)]
struct FileSpec {
    kind: FileKind,
    content: FileContent,
}

/// Block addresses of everything the builder placed.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub global_bitmap: BlockNumber,
    pub root: BlockNumber,
    pub journals: Vec<BlockNumber>,
    /// Group descriptors in group order.
    pub groups: Vec<BlockNumber>,
    /// User files in the order they were added.
    pub files: Vec<BlockNumber>,
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size_bits: u32,
    cluster_size_bits: u32,
    clusters: u32,
    clusters_per_group: u16,
    chains: u16,
    max_slots: u16,
    journal_clusters: Vec<u32>,
    inode_table_len: u32,
    local: bool,
    cluster_stack: String,
    label: String,
    incompat: IncompatFeatures,
    tunefs_flag: TunefsFlags,
    dirty_slots: Vec<u16>,
    files: Vec<FileSpec>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// 1 KiB blocks, 4 KiB clusters, 256 clusters in groups of 64, two
    /// slots, clustered on `o2cb`, inline data enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            block_size_bits: 10,
            cluster_size_bits: 12,
            clusters: 256,
            clusters_per_group: 64,
            chains: 2,
            max_slots: 2,
            journal_clusters: vec![4, 4],
            inode_table_len: 32,
            local: false,
            cluster_stack: "o2cb".to_owned(),
            label: "clustune".to_owned(),
            incompat: IncompatFeatures::SPARSE_ALLOC | IncompatFeatures::INLINE_DATA,
            tunefs_flag: TunefsFlags::NONE,
            dirty_slots: Vec::new(),
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn block_size_bits(mut self, bits: u32) -> Self {
        self.block_size_bits = bits;
        self
    }

    #[must_use]
    pub fn cluster_size_bits(mut self, bits: u32) -> Self {
        self.cluster_size_bits = bits;
        self
    }

    #[must_use]
    pub fn clusters(mut self, clusters: u32) -> Self {
        self.clusters = clusters;
        self
    }

    #[must_use]
    pub fn clusters_per_group(mut self, cpg: u16) -> Self {
        self.clusters_per_group = cpg;
        self
    }

    #[must_use]
    pub fn chains(mut self, chains: u16) -> Self {
        self.chains = chains;
        self
    }

    /// Set the slot count; every slot gets a journal of `journal_clusters`.
    #[must_use]
    pub fn slots(mut self, slots: u16, journal_clusters: u32) -> Self {
        self.max_slots = slots;
        self.journal_clusters = vec![journal_clusters; usize::from(slots)];
        self
    }

    #[must_use]
    pub fn journal_clusters(mut self, slot: u16, clusters: u32) -> Self {
        if let Some(entry) = self.journal_clusters.get_mut(usize::from(slot)) {
            *entry = clusters;
        }
        self
    }

    #[must_use]
    pub fn dirty_journal(mut self, slot: u16) -> Self {
        self.dirty_slots.push(slot);
        self
    }

    #[must_use]
    pub fn inode_table_len(mut self, len: u32) -> Self {
        self.inode_table_len = len;
        self
    }

    /// Single-node filesystem (`LOCAL_MOUNT`), no cluster stack recorded.
    #[must_use]
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    #[must_use]
    pub fn cluster_stack(mut self, name: &str) -> Self {
        self.cluster_stack = name.to_owned();
        self
    }

    #[must_use]
    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_owned();
        self
    }

    #[must_use]
    pub fn with_incompat(mut self, feature: IncompatFeatures) -> Self {
        self.incompat.insert(feature);
        self
    }

    #[must_use]
    pub fn without_incompat(mut self, feature: IncompatFeatures) -> Self {
        self.incompat.remove(feature);
        self
    }

    #[must_use]
    pub fn tunefs_flag(mut self, flag: TunefsFlags) -> Self {
        self.tunefs_flag = flag;
        self
    }

    /// Add a file whose data is stored inline in the inode.
    #[must_use]
    pub fn file(mut self, kind: FileKind, data: &[u8]) -> Self {
        self.files.push(FileSpec {
            kind,
            content: FileContent::Inline(data.to_vec()),
        });
        self
    }

    /// Add a regular file mapped by a single extent of `clusters`.
    #[must_use]
    pub fn extent_file(mut self, clusters: u32) -> Self {
        self.files.push(FileSpec {
            kind: FileKind::Regular,
            content: FileContent::Extents(clusters),
        });
        self
    }

    #[expect(clippy::too_many_lines, clippy::cast_possible_truncation)]
    pub fn build(self) -> Result<BuiltImage> {
        self.check()?;
        let bs = 1_usize << self.block_size_bits;
        let shift = self.cluster_size_bits - self.block_size_bits;
        let cluster_size = 1_u64 << self.cluster_size_bits;
        let total_blocks = u64::from(self.clusters) << shift;
        let len = usize::try_from(total_blocks)
            .ok()
            .and_then(|blocks| blocks.checked_mul(bs))
            .ok_or_else(|| CtnError::Format("image too large".to_owned()))?;
        let mut bytes = vec![0_u8; len];

        let cluster_of = |block: u64| -> usize {
            usize::try_from(block >> shift).unwrap_or(usize::MAX)
        };
        let block_of = |cluster: usize| -> u64 { (cluster as u64) << shift };

        // Inode table: bitmap, journals, root, then user files.
        let first_meta = (SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE).div_ceil(bs) as u64;
        let table = first_meta;
        let global_bitmap = BlockNumber(table);
        let journals: Vec<BlockNumber> = (0..u64::from(self.max_slots))
            .map(|slot| BlockNumber(table + 1 + slot))
            .collect();
        let root = BlockNumber(table + 1 + u64::from(self.max_slots));
        let files: Vec<BlockNumber> = (0..self.files.len() as u64)
            .map(|i| BlockNumber(root.0 + 1 + i))
            .collect();
        let group0_desc = table + u64::from(self.inode_table_len);

        // Cluster usage map.
        let cpg = usize::from(self.clusters_per_group);
        let clusters = self.clusters as usize;
        let group_count = clusters.div_ceil(cpg);
        let mut used = vec![false; clusters];
        for flag in used.iter_mut().take(cluster_of(group0_desc) + 1) {
            *flag = true;
        }
        let mut groups = vec![BlockNumber(group0_desc)];
        for g in 1..group_count {
            used[g * cpg] = true;
            groups.push(BlockNumber(block_of(g * cpg)));
        }

        let mut allocate = |count: u32| -> Result<Option<usize>> {
            let count = count as usize;
            if count == 0 {
                return Ok(None);
            }
            let mut run = 0;
            for idx in 0..clusters {
                run = if used[idx] { 0 } else { run + 1 };
                if run == count {
                    let start = idx + 1 - count;
                    used[start..=idx].iter_mut().for_each(|flag| *flag = true);
                    return Ok(Some(start));
                }
            }
            Err(CtnError::NoSpace {
                needed: count as u64,
                free: used.iter().filter(|flag| !**flag).count() as u64,
            })
        };

        let mut inodes = Vec::new();
        let extent_payload = |start: Option<usize>, count: u32| {
            let mut list = ExtentList::empty(bs);
            if let Some(start) = start {
                list.records.push(ExtentRec {
                    cpos: 0,
                    clusters: count,
                    blkno: BlockNumber(block_of(start)),
                });
            }
            InodePayload::Extents(list)
        };

        for (slot, (&blkno, &jc)) in journals.iter().zip(&self.journal_clusters).enumerate() {
            let start = allocate(jc)?;
            let dirty = self.dirty_slots.iter().any(|s| usize::from(*s) == slot);
            inodes.push(Dinode {
                blkno,
                flags: INODE_VALID_FL | INODE_SYSTEM_FL | INODE_JOURNAL_FL,
                dyn_features: 0,
                mode: S_IFREG | 0o644,
                clusters: jc,
                size: u64::from(jc) * cluster_size,
                id1: InodeId1::Journal {
                    flags: if dirty { JOURNAL_DIRTY_FL } else { 0 },
                },
                id2: extent_payload(start, jc),
            });
        }

        let root_start = allocate(1)?;
        inodes.push(Dinode {
            blkno: root,
            flags: INODE_VALID_FL,
            dyn_features: 0,
            mode: FileKind::Directory.mode(),
            clusters: 1,
            size: cluster_size,
            id1: InodeId1::None,
            id2: extent_payload(root_start, 1),
        });

        let inline_capacity = u16::try_from(id2_capacity(bs))
            .map_err(|_| CtnError::Format("inline capacity overflows u16".to_owned()))?;
        for (entry, &blkno) in self.files.iter().zip(&files) {
            let inode = match &entry.content {
                FileContent::Inline(data) => Dinode {
                    blkno,
                    flags: INODE_VALID_FL,
                    dyn_features: INLINE_DATA_FL,
                    mode: entry.kind.mode(),
                    clusters: 0,
                    size: data.len() as u64,
                    id1: InodeId1::None,
                    id2: InodePayload::Inline(InlineData {
                        capacity: inline_capacity,
                        data: data.clone(),
                    }),
                },
                FileContent::Extents(count) => {
                    let start = allocate(*count)?;
                    Dinode {
                        blkno,
                        flags: INODE_VALID_FL,
                        dyn_features: 0,
                        mode: entry.kind.mode(),
                        clusters: *count,
                        size: u64::from(*count) * cluster_size,
                        id1: InodeId1::None,
                        id2: extent_payload(start, *count),
                    }
                }
            };
            inodes.push(inode);
        }

        // Groups and chains.
        let nchains = usize::from(self.chains).min(group_count);
        let bitmap_bytes = bs - GROUP_BITMAP_OFFSET;
        let size = u16::try_from(bitmap_bytes)
            .map_err(|_| CtnError::Format("group bitmap overflows u16".to_owned()))?;
        let mut descs = Vec::with_capacity(group_count);
        for (g, &blkno) in groups.iter().enumerate() {
            let start = g * cpg;
            let bits = cpg.min(clusters - start);
            let mut bitmap = vec![0_u8; bitmap_bytes];
            let mut free = 0_u16;
            for bit in 0..bits {
                if used[start + bit] {
                    bitmap[bit / 8] |= 1 << (bit % 8);
                } else {
                    free += 1;
                }
            }
            let next = groups.get(g + nchains).copied().unwrap_or(BlockNumber(0));
            descs.push(GroupDesc {
                blkno,
                parent_dinode: global_bitmap,
                next_group: next,
                start_cluster: ClusterNumber(start as u32),
                chain: ChainIndex((g % nchains) as u16),
                size,
                bits: bits as u16,
                free_bits_count: free,
                bitmap,
            });
        }
        let mut records = vec![
            ChainRec {
                free: 0,
                total: 0,
                blkno: BlockNumber(0),
            };
            nchains
        ];
        for (g, gd) in descs.iter().enumerate() {
            let rec = &mut records[g % nchains];
            if rec.blkno.is_null() {
                rec.blkno = gd.blkno;
            }
            rec.total += u32::from(gd.bits);
            rec.free += u32::from(gd.free_bits_count);
        }
        let total_free: u32 = records.iter().map(|rec| rec.free).sum();
        inodes.push(Dinode {
            blkno: global_bitmap,
            flags: INODE_VALID_FL | INODE_SYSTEM_FL | INODE_BITMAP_FL | INODE_CHAIN_FL,
            dyn_features: 0,
            mode: 0,
            clusters: self.clusters,
            size: u64::from(self.clusters) * cluster_size,
            id1: InodeId1::Bitmap {
                used: self.clusters - total_free,
                total: self.clusters,
            },
            id2: InodePayload::Chains(ChainList {
                clusters_per_group: self.clusters_per_group,
                bits_per_cluster: 1,
                capacity: u16::try_from(record_capacity(bs)).unwrap_or(u16::MAX),
                records,
            }),
        });

        for inode in &inodes {
            inode
                .encode_into(block_mut(&mut bytes, inode.blkno, bs)?)
                .map_err(|err| crate::corruption(inode.blkno, &err))?;
        }
        for gd in &descs {
            gd.encode_into(block_mut(&mut bytes, gd.blkno, bs)?)
                .map_err(|err| crate::corruption(gd.blkno, &err))?;
        }

        let superblock = Superblock {
            rev_major: 0,
            rev_minor: 90,
            block_size_bits: self.block_size_bits,
            cluster_size_bits: self.cluster_size_bits,
            blocks_count: total_blocks,
            clusters_count: self.clusters,
            max_slots: self.max_slots,
            feature_compat: CompatFeatures::NONE,
            feature_incompat: if self.local {
                self.incompat.with(IncompatFeatures::LOCAL_MOUNT)
            } else {
                self.incompat
            },
            feature_ro_compat: RoCompatFeatures::NONE,
            tunefs_flag: self.tunefs_flag,
            cluster_stack: if self.local {
                String::new()
            } else {
                self.cluster_stack.clone()
            },
            label: self.label.clone(),
            global_bitmap_blkno: global_bitmap,
            root_blkno: root,
            inode_table_blkno: BlockNumber(table),
            inode_count: self.inode_table_len,
            journal_blknos: journals.clone(),
        };
        superblock
            .encode_into(&mut bytes[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE])
            .map_err(|err| CtnError::Format(err.to_string()))?;

        Ok(BuiltImage {
            bytes,
            global_bitmap,
            root,
            journals,
            groups,
            files,
        })
    }

    fn check(&self) -> Result<()> {
        let fail = |msg: &str| Err(CtnError::Format(format!("image builder: {msg}")));
        if !(10..=16).contains(&self.block_size_bits) {
            return fail("block size must be 1 KiB to 64 KiB");
        }
        if self.cluster_size_bits < self.block_size_bits || self.cluster_size_bits > 20 {
            return fail("cluster size must be block size to 1 MiB");
        }
        if self.max_slots == 0 || self.max_slots > MAX_SLOTS {
            return fail("slot count must be 1 to 32");
        }
        if self.chains == 0 || usize::from(self.chains) > record_capacity(1 << self.block_size_bits) {
            return fail("chain count must fit the chain list");
        }
        let bits_capacity = ((1_usize << self.block_size_bits) - GROUP_BITMAP_OFFSET) * 8;
        if self.clusters_per_group < 2 || usize::from(self.clusters_per_group) > bits_capacity {
            return fail("clusters per group must fit the group bitmap");
        }
        let needed = 2 + u64::from(self.max_slots) + self.files.len() as u64;
        if needed > u64::from(self.inode_table_len) {
            return fail("inode table too small for the requested files");
        }
        let bs = 1_u64 << self.block_size_bits;
        let meta_end = ((SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE) as u64).div_ceil(bs)
            + u64::from(self.inode_table_len)
            + 1;
        let meta_clusters = meta_end.div_ceil(1_u64 << (self.cluster_size_bits - self.block_size_bits));
        if meta_clusters >= u64::from(self.clusters_per_group) {
            return fail("metadata does not fit in the first group");
        }
        let last_group_bits = self.clusters % u32::from(self.clusters_per_group);
        if last_group_bits == 1 {
            return fail("last group would hold only its own descriptor");
        }
        Ok(())
    }
}

fn block_mut(bytes: &mut [u8], blkno: BlockNumber, bs: usize) -> Result<&mut [u8]> {
    usize::try_from(blkno.0)
        .ok()
        .and_then(|b| b.checked_mul(bs))
        .and_then(|at| bytes.get_mut(at..at + bs))
        .ok_or_else(|| CtnError::Format(format!("block {blkno} lies outside the image")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FsImage, OpenMode};
    use ctn_block::MemByteDevice;
    use ctn_types::{Cx, SlotNumber};
    use std::sync::Arc;

    #[test]
    fn chain_totals_match_group_sums() {
        let cx = Cx::for_testing();
        let built = ImageBuilder::new().chains(3).build().expect("build");
        let image = FsImage::open(
            &cx,
            "img",
            Arc::new(MemByteDevice::from_bytes(built.bytes.clone())),
            OpenMode::ReadOnly,
        )
        .expect("open");
        let bitmap = image.read_inode(&cx, built.global_bitmap).expect("bitmap");
        let cl = bitmap.chain_list().expect("chains").clone();
        assert_eq!(cl.records.len(), 3);

        let mut grand_total = 0;
        for (idx, rec) in cl.records.iter().enumerate() {
            let (mut total, mut free) = (0_u32, 0_u32);
            let mut blkno = rec.blkno;
            while !blkno.is_null() {
                let gd = image.read_group_desc(&cx, blkno).expect("group");
                assert_eq!(usize::from(gd.chain.0), idx);
                total += u32::from(gd.bits);
                free += u32::from(gd.free_bits_count);
                assert!(gd.free_bits_count < gd.bits);
                blkno = gd.next_group;
            }
            assert_eq!((total, free), (rec.total, rec.free));
            grand_total += total;
        }
        assert_eq!(grand_total, 256);
    }

    #[test]
    fn journals_get_requested_sizes_and_dirty_flags() {
        let cx = Cx::for_testing();
        let built = ImageBuilder::new()
            .slots(3, 4)
            .journal_clusters(2, 9)
            .dirty_journal(1)
            .build()
            .expect("build");
        let image = FsImage::open(
            &cx,
            "img",
            Arc::new(MemByteDevice::from_bytes(built.bytes)),
            OpenMode::ReadOnly,
        )
        .expect("open");
        let j2 = image
            .read_inode(&cx, built.journals[2])
            .expect("journal 2");
        assert_eq!(j2.clusters, 9);
        assert!(!j2.is_journal_dirty());
        let j1 = image
            .read_inode(
                &cx,
                image
                    .lookup_system_inode(crate::SystemInode::Journal, SlotNumber(1))
                    .expect("lookup"),
            )
            .expect("journal 1");
        assert!(j1.is_journal_dirty());
    }

    #[test]
    fn local_images_record_no_stack() {
        let cx = Cx::for_testing();
        let built = ImageBuilder::new().local().build().expect("build");
        let image = FsImage::open(
            &cx,
            "img",
            Arc::new(MemByteDevice::from_bytes(built.bytes)),
            OpenMode::ReadOnly,
        )
        .expect("open");
        assert!(image.superblock().is_local());
        assert!(image.superblock().cluster_stack.is_empty());
    }

    #[test]
    fn too_many_files_for_table_is_rejected() {
        let mut builder = ImageBuilder::new().inode_table_len(6);
        for _ in 0..3 {
            builder = builder.file(FileKind::Regular, b"x");
        }
        assert!(matches!(builder.build(), Err(CtnError::Format(_))));
    }

    #[test]
    fn extent_files_consume_clusters() {
        let free_before = {
            let built = ImageBuilder::new().build().expect("build");
            free_of(&built)
        };
        let built = ImageBuilder::new().extent_file(10).build().expect("build");
        assert_eq!(free_of(&built), free_before - 10);
    }

    fn free_of(built: &BuiltImage) -> u32 {
        let cx = Cx::for_testing();
        let image = FsImage::open(
            &cx,
            "img",
            Arc::new(MemByteDevice::from_bytes(built.bytes.clone())),
            OpenMode::ReadOnly,
        )
        .expect("open");
        match image.read_inode(&cx, built.global_bitmap).expect("bitmap").id1 {
            InodeId1::Bitmap { used, total } => total - used,
            other => panic!("unexpected id1 {other:?}"),
        }
    }
}
