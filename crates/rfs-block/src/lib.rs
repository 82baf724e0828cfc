#![forbid(unsafe_code)]
//! Block I/O layer and metadata buffer cache.
//!
//! Provides the `ByteDevice` / `BlockDevice` traits, file- and
//! memory-backed implementations, and `BufCache` — the buffer cache the
//! mapping engine reads btree blocks through. The engine never touches
//! raw device I/O directly.
//!
//! Buffer pinning is scope-bound: a [`BufHandle`] pins its block for as
//! long as it lives and unpins on drop, including early-return error
//! paths. Dirty blocks reach the device on [`BufCache::flush`].

use parking_lot::Mutex;
use rfs_error::{Result, RfsError};
use rfs_types::DiskBlock;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

// ── Byte devices ────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a
/// shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(u64::try_from(len).map_err(|_| {
            RfsError::InvalidGeometry("I/O length overflows u64".to_owned())
        })?)
        .ok_or_else(|| RfsError::InvalidGeometry("I/O range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(RfsError::InvalidGeometry(format!(
            "I/O out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

// ── Block devices ───────────────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: DiskBlock) -> Result<Vec<u8>>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: DiskBlock, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Adapter exposing any [`ByteDevice`] at block granularity.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(RfsError::InvalidGeometry(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let len = inner.len_bytes();
        if len % u64::from(block_size) != 0 {
            return Err(RfsError::InvalidGeometry(format!(
                "device length is not block-aligned: len_bytes={len} block_size={block_size}"
            )));
        }
        let block_count = len / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: DiskBlock) -> Result<Vec<u8>> {
        if block.0 >= self.block_count {
            return Err(RfsError::corrupt(
                block.0,
                format!("block out of range (block_count={})", self.block_count),
            ));
        }
        let offset = block.0 * u64::from(self.block_size);
        let mut buf = vec![0_u8; self.block_size as usize];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn write_block(&self, block: DiskBlock, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(RfsError::InvalidGeometry(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if block.0 >= self.block_count {
            return Err(RfsError::corrupt(
                block.0,
                format!("block out of range (block_count={})", self.block_count),
            ));
        }
        let offset = block.0 * u64::from(self.block_size);
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// In-memory block device. Unwritten blocks read back as zeros.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: DiskBlock) -> Result<Vec<u8>> {
        if block.0 >= self.block_count {
            return Err(RfsError::corrupt(
                block.0,
                format!("block out of range (block_count={})", self.block_count),
            ));
        }
        let blocks = self.blocks.lock();
        Ok(blocks
            .get(&block.0)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; self.block_size as usize]))
    }

    fn write_block(&self, block: DiskBlock, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(RfsError::InvalidGeometry(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if block.0 >= self.block_count {
            return Err(RfsError::corrupt(
                block.0,
                format!("block out of range (block_count={})", self.block_count),
            ));
        }
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Buffer cache ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CacheState {
    resident: HashMap<u64, Vec<u8>>,
    dirty: HashSet<u64>,
    pins: HashMap<u64, u32>,
}

/// Metadata buffer cache over a [`BlockDevice`].
///
/// Write-back: `write_block` updates the cached copy and marks it dirty;
/// `flush` pushes dirty blocks to the device in block order.
#[derive(Debug)]
pub struct BufCache<D: BlockDevice> {
    dev: D,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> BufCache<D> {
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            state: Mutex::new(CacheState::default()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    /// Read a block through the cache, pinning it for the handle's lifetime.
    pub fn read_block(&self, block: DiskBlock) -> Result<BufHandle<'_, D>> {
        let data = {
            let mut state = self.state.lock();
            if let Some(data) = state.resident.get(&block.0) {
                data.clone()
            } else {
                drop(state);
                let data = self.dev.read_block(block)?;
                state = self.state.lock();
                state.resident.insert(block.0, data.clone());
                data
            }
        };
        self.pin(block);
        Ok(BufHandle {
            cache: self,
            block,
            data,
        })
    }

    /// Materialize a freshly allocated block: zeroed, resident, and dirty.
    ///
    /// The previous on-disk contents are never read; the caller owns the
    /// whole block and will overwrite it.
    pub fn get_new_block(&self, block: DiskBlock) -> Result<BufHandle<'_, D>> {
        if block.0 >= self.dev.block_count() {
            return Err(RfsError::corrupt(
                block.0,
                format!(
                    "new block out of range (block_count={})",
                    self.dev.block_count()
                ),
            ));
        }
        let data = vec![0_u8; self.dev.block_size() as usize];
        {
            let mut state = self.state.lock();
            state.resident.insert(block.0, data.clone());
            state.dirty.insert(block.0);
        }
        self.pin(block);
        Ok(BufHandle {
            cache: self,
            block,
            data,
        })
    }

    /// Replace a block's cached contents and mark it dirty.
    pub fn write_block(&self, block: DiskBlock, data: &[u8]) -> Result<()> {
        if data.len() != self.dev.block_size() as usize {
            return Err(RfsError::InvalidGeometry(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.dev.block_size()
            )));
        }
        if block.0 >= self.dev.block_count() {
            return Err(RfsError::corrupt(
                block.0,
                format!(
                    "block out of range (block_count={})",
                    self.dev.block_count()
                ),
            ));
        }
        let mut state = self.state.lock();
        state.resident.insert(block.0, data.to_vec());
        state.dirty.insert(block.0);
        Ok(())
    }

    /// Drop a block from the cache (e.g., after its physical space is freed).
    ///
    /// Pinned blocks are never invalidated — that is a caller bug surfaced
    /// as corruption.
    pub fn invalidate(&self, block: DiskBlock) -> Result<()> {
        let mut state = self.state.lock();
        if state.pins.get(&block.0).copied().unwrap_or(0) > 0 {
            return Err(RfsError::corrupt(
                block.0,
                "invalidating a pinned buffer",
            ));
        }
        state.resident.remove(&block.0);
        state.dirty.remove(&block.0);
        Ok(())
    }

    /// Write all dirty blocks to the device and sync it.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<(u64, Vec<u8>)> = {
            let state = self.state.lock();
            let mut blocks: Vec<u64> = state.dirty.iter().copied().collect();
            blocks.sort_unstable();
            blocks
                .into_iter()
                .filter_map(|b| state.resident.get(&b).map(|d| (b, d.clone())))
                .collect()
        };
        trace!(dirty_blocks = dirty.len(), "bufcache_flush");
        for (block, data) in dirty {
            self.dev.write_block(DiskBlock(block), &data)?;
            self.state.lock().dirty.remove(&block);
        }
        self.dev.sync()
    }

    /// Current pin count for a block (diagnostics and tests).
    #[must_use]
    pub fn pin_count(&self, block: DiskBlock) -> u32 {
        self.state.lock().pins.get(&block.0).copied().unwrap_or(0)
    }

    fn pin(&self, block: DiskBlock) {
        let mut state = self.state.lock();
        *state.pins.entry(block.0).or_insert(0) += 1;
    }

    fn unpin(&self, block: DiskBlock) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(&block.0) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(&block.0);
            }
        }
    }
}

/// A pinned view of one cached block.
///
/// Holding the handle keeps the block pinned; dropping it releases the
/// pin, including on early-return error paths.
#[derive(Debug)]
pub struct BufHandle<'a, D: BlockDevice> {
    cache: &'a BufCache<D>,
    block: DiskBlock,
    data: Vec<u8>,
}

impl<D: BlockDevice> BufHandle<'_, D> {
    #[must_use]
    pub fn block(&self) -> DiskBlock {
        self.block
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl<D: BlockDevice> Drop for BufHandle<'_, D> {
    fn drop(&mut self) {
        self.cache.unpin(self.block);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
