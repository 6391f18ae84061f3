#![forbid(unsafe_code)]
//! Chain allocator support.
//!
//! ## Layers
//!
//! 1. **Bitmap**: raw bit manipulation and run scanning on group bitmaps.
//! 2. **Global bitmap**: free-cluster accounting and single-cluster claims
//!    that keep group, chain record and allocator inode counts in step.
//! 3. **Conversion**: moving an inode's inline data into a freshly claimed
//!    cluster ([`convert_inline_data_to_extents`]).

mod convert;

pub use convert::convert_inline_data_to_extents;

use ctn_error::{CtnError, Result};
use ctn_ondisk::{FsImage, InodeId1, SystemInode};
use ctn_types::{ClusterNumber, Cx, SlotNumber};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice. Bits past the slice read as set.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    match bitmap.get(byte_idx) {
        Some(byte) => (byte >> bit_idx) & 1 == 1,
        None => true,
    }
}

pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if let Some(byte) = bitmap.get_mut(byte_idx) {
        *byte |= 1 << (idx % 8);
    }
}

pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if let Some(byte) = bitmap.get_mut(byte_idx) {
        *byte &= !(1 << (idx % 8));
    }
}

/// First clear bit at or after `start` among the first `bits`; `bits` if none.
#[must_use]
pub fn find_next_bit_clear(bitmap: &[u8], bits: u32, start: u32) -> u32 {
    (start..bits)
        .find(|&idx| !bitmap_get(bitmap, idx))
        .unwrap_or(bits)
}

/// First set bit at or after `start` among the first `bits`; `bits` if none.
#[must_use]
pub fn find_next_bit_set(bitmap: &[u8], bits: u32, start: u32) -> u32 {
    (start..bits)
        .find(|&idx| bitmap_get(bitmap, idx))
        .unwrap_or(bits)
}

/// Free bits among the first `bits`, counted as maximal runs of clear bits
/// scanned left to right. A run ends at the first set bit or at `bits`.
#[must_use]
pub fn count_free_runs(bitmap: &[u8], bits: u32) -> u32 {
    let mut free = 0;
    let mut end = 0;
    while end < bits {
        let start = find_next_bit_clear(bitmap, bits, end);
        if start >= bits {
            break;
        }
        end = find_next_bit_set(bitmap, bits, start);
        free += end - start;
    }
    free
}

// ── Global bitmap ───────────────────────────────────────────────────────────

fn bitmap_counts(cx: &Cx, image: &FsImage) -> Result<(ctn_ondisk::Dinode, u32, u32)> {
    let blkno = image.lookup_system_inode(SystemInode::GlobalBitmap, SlotNumber(0))?;
    let inode = image.read_inode(cx, blkno)?;
    match inode.id1 {
        InodeId1::Bitmap { used, total } => Ok((inode, used, total)),
        _ => Err(CtnError::Corruption {
            block: blkno.0,
            detail: "global bitmap inode carries no bitmap counts".to_owned(),
        }),
    }
}

/// Free clusters according to the global bitmap inode (`total - used`).
pub fn free_clusters(cx: &Cx, image: &FsImage) -> Result<u32> {
    let (_, used, total) = bitmap_counts(cx, image)?;
    Ok(total.saturating_sub(used))
}

/// Allocate one cluster from the global bitmap.
///
/// Chains are tried in record order and groups in link order; the first
/// clear bit wins. The group descriptor is written before the allocator
/// inode.
pub fn claim_cluster(cx: &Cx, image: &FsImage) -> Result<ClusterNumber> {
    let (mut inode, used, total) = bitmap_counts(cx, image)?;
    let chain_count = inode.chain_list().map_or(0, |cl| cl.records.len());

    for chain in 0..chain_count {
        let Some(cl) = inode.chain_list() else {
            break;
        };
        if cl.records[chain].free == 0 {
            continue;
        }
        let mut blkno = cl.records[chain].blkno;
        while !blkno.is_null() {
            cx.checkpoint().map_err(|_| CtnError::Cancelled)?;
            let mut gd = image.read_group_desc(cx, blkno)?;
            if gd.free_bits_count > 0 {
                let bits = u32::from(gd.bits);
                let bit = find_next_bit_clear(&gd.bitmap, bits, 0);
                if bit < bits {
                    bitmap_set(&mut gd.bitmap, bit);
                    gd.free_bits_count -= 1;
                    image.write_group_desc(cx, &gd)?;

                    if let Some(cl) = inode.chain_list_mut() {
                        cl.records[chain].free = cl.records[chain].free.saturating_sub(1);
                    }
                    inode.id1 = InodeId1::Bitmap {
                        used: used + 1,
                        total,
                    };
                    image.write_inode(cx, &inode)?;

                    let cluster = ClusterNumber(gd.start_cluster.0 + bit);
                    trace!(group = gd.blkno.0, bit, cluster = cluster.0, "claimed cluster");
                    return Ok(cluster);
                }
            }
            blkno = gd.next_group;
        }
    }

    debug!(device = image.device_name(), "global bitmap exhausted");
    Err(CtnError::NoSpace {
        needed: 1,
        free: u64::from(total.saturating_sub(used)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctn_block::MemByteDevice;
    use ctn_ondisk::{ImageBuilder, OpenMode};
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn runs_stop_at_set_bits_and_end() {
        // bits: 0 set, 1-3 clear, 4 set, 5-7 clear | 8-9 clear
        let bm = [0b0001_0001_u8, 0b0000_0000];
        assert_eq!(count_free_runs(&bm, 10), 8);
        assert_eq!(count_free_runs(&bm, 4), 3);
        assert_eq!(find_next_bit_clear(&bm, 10, 0), 1);
        assert_eq!(find_next_bit_set(&bm, 10, 1), 4);
        assert_eq!(find_next_bit_set(&bm, 10, 5), 10);
    }

    #[test]
    fn set_and_clear_ignore_out_of_range() {
        let mut bm = [0_u8; 1];
        bitmap_set(&mut bm, 3);
        bitmap_set(&mut bm, 42);
        assert!(bitmap_get(&bm, 3));
        bitmap_clear(&mut bm, 3);
        assert!(!bitmap_get(&bm, 3));
        assert!(bitmap_get(&bm, 42));
    }

    proptest! {
        #[test]
        fn free_runs_equal_clear_bit_count(bytes in proptest::collection::vec(any::<u8>(), 1..64), cut in 0_u32..512) {
            let bits = cut.min(u32::try_from(bytes.len() * 8).unwrap());
            let clear = (0..bits).filter(|&i| !bitmap_get(&bytes, i)).count();
            prop_assert_eq!(count_free_runs(&bytes, bits) as usize, clear);
        }
    }

    #[test]
    fn claim_updates_every_counter() {
        let cx = Cx::for_testing();
        let built = ImageBuilder::new().build().expect("build");
        let mem = MemByteDevice::from_bytes(built.bytes);
        let image = FsImage::open(&cx, "mem", Arc::new(mem), OpenMode::ReadWrite).expect("open");

        let before = free_clusters(&cx, &image).expect("free");
        let cluster = claim_cluster(&cx, &image).expect("claim");
        assert_eq!(free_clusters(&cx, &image).expect("free"), before - 1);

        let bitmap = image.read_inode(&cx, built.global_bitmap).expect("bitmap");
        let rec = bitmap.chain_list().expect("chains").records[0];
        let gd = image.read_group_desc(&cx, rec.blkno).expect("group");
        assert!(bitmap_get(&gd.bitmap, cluster.0 - gd.start_cluster.0));
        assert_eq!(u32::from(gd.free_bits_count), count_free_runs(&gd.bitmap, u32::from(gd.bits)));
        assert_eq!(rec.free, u32::from(gd.free_bits_count) + {
            let mut rest = 0;
            let mut next = gd.next_group;
            while !next.is_null() {
                let g = image.read_group_desc(&cx, next).expect("group");
                rest += u32::from(g.free_bits_count);
                next = g.next_group;
            }
            rest
        });
    }

    #[test]
    fn exhausted_bitmap_reports_no_space() {
        let cx = Cx::for_testing();
        let built = ImageBuilder::new()
            .clusters(64)
            .clusters_per_group(64)
            .chains(1)
            .build()
            .expect("build");
        let mem = MemByteDevice::from_bytes(built.bytes);
        let image = FsImage::open(&cx, "mem", Arc::new(mem), OpenMode::ReadWrite).expect("open");

        let free = free_clusters(&cx, &image).expect("free");
        for _ in 0..free {
            claim_cluster(&cx, &image).expect("claim");
        }
        assert!(matches!(
            claim_cluster(&cx, &image),
            Err(CtnError::NoSpace { needed: 1, free: 0 })
        ));
    }
}
