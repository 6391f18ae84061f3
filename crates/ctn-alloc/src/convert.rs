use crate::claim_cluster;
use ctn_error::{CtnError, Result};
use ctn_ondisk::{ExtentList, ExtentRec, FsImage, InodePayload};
use ctn_types::{BlockNumber, Cx, INLINE_DATA_FL};
use tracing::debug;

/// Move an inode's inline data into a newly claimed cluster mapped by a
/// single extent.
///
/// An empty inline inode only loses its inline flag and gets an empty
/// extent list; no cluster is claimed. Inodes without inline data are left
/// untouched.
pub fn convert_inline_data_to_extents(cx: &Cx, image: &FsImage, blkno: BlockNumber) -> Result<()> {
    cx.checkpoint().map_err(|_| CtnError::Cancelled)?;
    let mut inode = image.read_inode(cx, blkno)?;
    let data = match &inode.id2 {
        InodePayload::Inline(inline) if inode.has_inline_data() => inline.data.clone(),
        _ => return Ok(()),
    };

    let block_size = image.block_size();
    let mut extents = ExtentList::empty(block_size);
    let mut clusters = 0;

    if !data.is_empty() {
        let cluster = claim_cluster(cx, image)?;
        let first = image.cluster_to_block(cluster);
        let blocks = u64::from(image.superblock().blocks_per_cluster());

        let mut buf = vec![0_u8; block_size];
        buf[..data.len()].copy_from_slice(&data);
        image.write_block(cx, first, &buf)?;
        buf.fill(0);
        for offset in 1..blocks {
            image.write_block(cx, BlockNumber(first.0 + offset), &buf)?;
        }

        extents.records.push(ExtentRec {
            cpos: 0,
            clusters: 1,
            blkno: first,
        });
        clusters = 1;
    }

    inode.dyn_features &= !INLINE_DATA_FL;
    inode.clusters = clusters;
    inode.id2 = InodePayload::Extents(extents);
    image.write_inode(cx, &inode)?;
    debug!(inode = blkno.0, bytes = data.len(), "converted inline data to extents");
    Ok(())
}
