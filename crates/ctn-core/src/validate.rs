//! Consistency checks run before an offline change.
//!
//! Both checks are read-only and fail fast: the first inconsistency found is
//! returned and scanning stops, since earlier damage often explains later
//! damage.

use ctn_alloc::count_free_runs;
use ctn_error::{CtnError, Result};
use ctn_ondisk::{ChainRec, FsImage, GroupDesc, SystemInode};
use ctn_types::{BlockNumber, ChainIndex, Cx, SlotNumber};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Where chain validation reads group descriptors from.
pub trait GroupSource {
    fn group_desc(&self, cx: &Cx, blkno: BlockNumber) -> Result<GroupDesc>;
}

impl GroupSource for FsImage {
    fn group_desc(&self, cx: &Cx, blkno: BlockNumber) -> Result<GroupDesc> {
        self.read_group_desc(cx, blkno)
    }
}

fn corrupt(block: BlockNumber, detail: String) -> CtnError {
    CtnError::CorruptChain {
        block: block.0,
        detail,
    }
}

/// Walk the groups linked from `rec` and check every group against its
/// bitmap and the chain record against the sum of its groups.
///
/// Per group, in order: owner inode, chain index, free count against the
/// clear-bit runs of the bitmap, bit count against bitmap capacity, and free
/// count strictly below the bit count.
pub fn validate_chain<S>(
    cx: &Cx,
    source: &S,
    allocator: BlockNumber,
    chain: ChainIndex,
    rec: &ChainRec,
) -> Result<()>
where
    S: GroupSource + ?Sized,
{
    let mut total = 0_u64;
    let mut free = 0_u64;
    let mut seen = HashSet::new();
    let mut blkno = rec.blkno;

    while !blkno.is_null() {
        cx.checkpoint().map_err(|_| CtnError::Cancelled)?;
        if !seen.insert(blkno) {
            return Err(corrupt(
                blkno,
                format!("chain {chain} links back to group {blkno}"),
            ));
        }
        let gd = source.group_desc(cx, blkno)?;

        if gd.parent_dinode != allocator {
            return Err(corrupt(
                blkno,
                format!(
                    "group belongs to inode {} but is linked from allocator {allocator}",
                    gd.parent_dinode
                ),
            ));
        }
        if gd.chain != chain {
            return Err(corrupt(
                blkno,
                format!("group is tagged chain {} but linked from chain {chain}", gd.chain),
            ));
        }
        let counted = count_free_runs(&gd.bitmap, u32::from(gd.bits));
        if counted != u32::from(gd.free_bits_count) {
            return Err(corrupt(
                blkno,
                format!(
                    "group claims {} free bits, bitmap has {counted}",
                    gd.free_bits_count
                ),
            ));
        }
        if u32::from(gd.bits) > u32::from(gd.size) * 8 {
            return Err(corrupt(
                blkno,
                format!(
                    "group has {} bits but only {} bytes of bitmap",
                    gd.bits, gd.size
                ),
            ));
        }
        if gd.free_bits_count >= gd.bits {
            return Err(corrupt(
                blkno,
                format!(
                    "group has {} free bits out of {}",
                    gd.free_bits_count, gd.bits
                ),
            ));
        }

        trace!(group = blkno.0, chain = chain.0, bits = gd.bits, free = gd.free_bits_count, "group ok");
        total += u64::from(gd.bits);
        free += u64::from(gd.free_bits_count);
        blkno = gd.next_group;
    }

    if total != u64::from(rec.total) {
        return Err(corrupt(
            allocator,
            format!(
                "chain {chain} claims {} total bits, its groups hold {total}",
                rec.total
            ),
        ));
    }
    if free != u64::from(rec.free) {
        return Err(corrupt(
            allocator,
            format!(
                "chain {chain} claims {} free bits, its groups hold {free}",
                rec.free
            ),
        ));
    }
    Ok(())
}

/// Validate every in-use chain of the chain allocator inode at `blkno`.
pub fn check_chain_allocator(cx: &Cx, image: &FsImage, blkno: BlockNumber) -> Result<()> {
    let inode = image.read_inode(cx, blkno)?;
    let Some(chains) = inode.chain_list() else {
        return Err(corrupt(blkno, "inode is not a chain allocator".to_owned()));
    };
    for (idx, rec) in chains.records.iter().enumerate() {
        let chain = ChainIndex(u16::try_from(idx).map_err(|_| {
            corrupt(blkno, format!("chain index {idx} out of range"))
        })?);
        validate_chain(cx, image, blkno, chain, rec)?;
    }
    Ok(())
}

/// Validate the global cluster bitmap.
pub fn global_bitmap_check(cx: &Cx, image: &FsImage) -> Result<()> {
    let blkno = image.lookup_system_inode(SystemInode::GlobalBitmap, SlotNumber(0))?;
    check_chain_allocator(cx, image, blkno)?;
    debug!(device = %image.device_name(), bitmap = blkno.0, "global bitmap is consistent");
    Ok(())
}

/// Result of a clean journal scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalSummary {
    pub slots: u16,
    /// Largest journal seen; the default size for new slots.
    pub max_clusters: u32,
}

/// Refuse to proceed while any slot's journal needs replay.
pub fn journal_check(cx: &Cx, image: &FsImage) -> Result<JournalSummary> {
    let slots = image.superblock().max_slots;
    let mut max_clusters = 0;
    for slot in (0..slots).map(SlotNumber) {
        cx.checkpoint().map_err(|_| CtnError::Cancelled)?;
        let blkno = image.lookup_system_inode(SystemInode::Journal, slot)?;
        let journal = image.read_inode(cx, blkno)?;
        max_clusters = max_clusters.max(journal.clusters);
        if journal.is_journal_dirty() {
            debug!(device = %image.device_name(), slot = slot.0, "dirty journal");
            return Err(CtnError::JournalDirty { slot: slot.0 });
        }
    }
    debug!(device = %image.device_name(), slots, max_clusters, "journals are clean");
    Ok(JournalSummary {
        slots,
        max_clusters,
    })
}
