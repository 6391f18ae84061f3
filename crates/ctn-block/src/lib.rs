#![forbid(unsafe_code)]
//! Block I/O layer for clustune sessions.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed and an
//! in-memory byte device, and the write-through LRU [`BlockCache`] that a
//! read-write session attaches as its I/O cache. All I/O takes a `&Cx` so a
//! pending termination request stops work between device calls.

use ctn_error::{CtnError, Result};
use ctn_types::{BlockNumber, Cx, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| CtnError::Cancelled)
}

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    let len = u64::try_from(len)
        .map_err(|_| CtnError::Format(format!("{what} length overflows u64")))?;
    offset
        .checked_add(len)
        .ok_or_else(|| CtnError::Format(format!("{what} range overflows u64")))
}

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

impl<T: ByteDevice + ?Sized> ByteDevice for Arc<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(cx, offset, buf)
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(cx, offset, buf)
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        (**self).sync(cx)
    }
}

/// File-backed byte device.
///
/// Uses `FileExt` positional I/O, so clones share the descriptor without
/// sharing a seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(CtnError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if !self.writable {
            return Err(CtnError::ReadOnly);
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(CtnError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device. Clones share the same backing bytes, which is how
/// tests model two sessions opening one device.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start =
            usize::try_from(offset).map_err(|_| CtnError::Format("offset overflow".to_owned()))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| CtnError::Format("range overflow".to_owned()))?;
        let total = self.bytes.lock().len();
        if end > total {
            return Err(CtnError::Format(format!(
                "access out of bounds: offset={offset} len={len} device_len={total}"
            )));
        }
        Ok(start..end)
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes.lock()[range]);
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let range = self.range(offset, buf.len())?;
        self.bytes.lock()[range].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)
    }
}

// ── Block devices ───────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()>;

    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    fn sync(&self, cx: &Cx) -> Result<()>;
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(CtnError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(CtnError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| CtnError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let len = usize::try_from(self.block_size)
            .map_err(|_| CtnError::Format("block_size does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.inner.read_exact_at(cx, offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| CtnError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(CtnError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(cx, offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}

// ── Session I/O cache ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct LruState {
    capacity: usize,
    order: VecDeque<BlockNumber>,
    resident: HashMap<BlockNumber, Vec<u8>>,
    stats: CacheStats,
}

impl LruState {
    fn touch(&mut self, block: BlockNumber) {
        if let Some(pos) = self.order.iter().position(|b| *b == block) {
            let _ = self.order.remove(pos);
        }
        self.order.push_back(block);
    }

    fn insert(&mut self, block: BlockNumber, bytes: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        self.touch(block);
        self.resident.insert(block, bytes);
        while self.order.len() > self.capacity {
            if let Some(victim) = self.order.pop_front() {
                let _ = self.resident.remove(&victim);
                trace!(block = victim.0, "cache evict");
            }
        }
    }
}

/// Write-through LRU cache around a [`BlockDevice`].
///
/// Starts disabled (capacity 0, pure pass-through). A session enables it with
/// [`BlockCache::enable`] once locking has succeeded. Writes always reach the
/// device before the cached copy is updated, so dropping the cache never loses
/// data.
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    inner: D,
    state: Mutex<LruState>,
}

impl<D: BlockDevice> BlockCache<D> {
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn enable(&self, capacity_blocks: usize) -> Result<()> {
        if capacity_blocks == 0 {
            return Err(CtnError::Internal(
                "cache capacity_blocks must be > 0".to_owned(),
            ));
        }
        self.state.lock().capacity = capacity_blocks;
        Ok(())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().capacity > 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }
}

impl<D: BlockDevice> BlockDevice for BlockCache<D> {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        {
            let mut state = self.state.lock();
            if let Some(bytes) = state.resident.get(&block).cloned() {
                state.stats.hits += 1;
                state.touch(block);
                return Ok(BlockBuf::new(bytes));
            }
            state.stats.misses += 1;
        }

        let buf = self.inner.read_block(cx, block)?;
        self.state.lock().insert(block, buf.as_slice().to_vec());
        Ok(buf)
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.inner.write_block(cx, block, data)?;
        self.state.lock().insert(block, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        self.inner.sync(cx)
    }
}

// ── Superblock region ───────────────────────────────────────────────────────

fn superblock_offset() -> Result<u64> {
    u64::try_from(SUPERBLOCK_OFFSET)
        .map_err(|_| CtnError::Format("superblock offset does not fit u64".to_owned()))
}

/// Read the superblock region (1024 bytes at offset 1024).
pub fn read_superblock_region(cx: &Cx, dev: &dyn ByteDevice) -> Result<[u8; SUPERBLOCK_SIZE]> {
    let mut buf = [0_u8; SUPERBLOCK_SIZE];
    dev.read_exact_at(cx, superblock_offset()?, &mut buf)?;
    Ok(buf)
}

pub fn write_superblock_region(
    cx: &Cx,
    dev: &dyn ByteDevice,
    region: &[u8; SUPERBLOCK_SIZE],
) -> Result<()> {
    dev.write_all_at(cx, superblock_offset()?, region)
}
