#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, file and memory backed
//! devices, and the write-back [`BlockCache`] every volume component reads and
//! writes blocks through.

mod cache;
mod device;

pub use cache::{BlockCache, CacheStats};
pub use device::{FileByteDevice, MemoryByteDevice};

use bfs_error::{BfsError, Result};
use bfs_types::{
    BlockNumber, BlockSize, ByteOffset, SUPER_BLOCK_OFFSET, SUPER_BLOCK_PROBE_SIZE,
    SUPER_BLOCK_SIZE,
};
use std::sync::Arc;

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
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Whether the device refuses writes.
    fn is_read_only(&self) -> bool;
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Read-only view over block contents.
///
/// Implemented by the cache and by an open transaction, so metadata readers
/// observe the writes staged in the transaction they run under.
pub trait BlockRead {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    fn block_size(&self) -> u32;
}

/// Block view over the first `block_count` blocks of a shared byte device.
pub struct ByteBlockDevice {
    inner: Arc<dyn ByteDevice>,
    block_size: BlockSize,
    block_count: u64,
}

impl std::fmt::Debug for ByteBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBlockDevice")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

impl ByteBlockDevice {
    /// Fails with `DeviceTooSmall` when `block_count` blocks do not fit the device.
    pub fn new(
        inner: Arc<dyn ByteDevice>,
        block_size: BlockSize,
        block_count: u64,
    ) -> Result<Self> {
        let fs_bytes = block_size
            .block_to_byte(BlockNumber(block_count))
            .ok_or_else(|| BfsError::InvalidGeometry("block count overflows u64".to_owned()))?;
        let device_bytes = inner.len_bytes();
        if fs_bytes > device_bytes {
            return Err(BfsError::DeviceTooSmall {
                device_bytes,
                fs_bytes,
            });
        }
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<dyn ByteDevice> {
        &self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<ByteOffset> {
        if block.0 >= self.block_count {
            return Err(BfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .to_byte_offset(self.block_size)
            .ok_or_else(|| BfsError::Format("block offset overflow".to_owned()))
    }
}

impl BlockDevice for ByteBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_size.as_usize();
        if data.len() != expected {
            return Err(BfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Read the superblock probe region (1024 bytes at offset 0).
///
/// Covers both the alternate superblock location at 0 and the primary at 512.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<[u8; SUPER_BLOCK_PROBE_SIZE]> {
    let mut buf = [0_u8; SUPER_BLOCK_PROBE_SIZE];
    dev.read_exact_at(ByteOffset::ZERO, &mut buf)?;
    Ok(buf)
}

/// Write a serialized superblock at its primary location (offset 512).
pub fn write_superblock_region(dev: &dyn ByteDevice, bytes: &[u8; SUPER_BLOCK_SIZE]) -> Result<()> {
    dev.write_all_at(ByteOffset(SUPER_BLOCK_OFFSET as u64), bytes)
}
