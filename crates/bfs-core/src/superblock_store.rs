//! In-memory superblock and its single write path.

use bfs_block::{ByteDevice, write_superblock_region};
use bfs_error::{BfsError, Result};
use bfs_journal::{AnchorUpdate, LogAnchor, LogPointers};
use bfs_ondisk::SuperBlock;
use bfs_types::SUPER_BLOCK_SIZE;
use parking_lot::Mutex;
use std::sync::Arc;

/// Host-native superblock of a volume.
///
/// Every write serializes the whole structure and stores it at byte 512,
/// under the lock, so concurrent updates reach the device in order. The
/// journal anchors its pointers here.
pub struct SuperBlockStore {
    device: Arc<dyn ByteDevice>,
    current: Mutex<SuperBlock>,
}

impl std::fmt::Debug for SuperBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperBlockStore")
            .field("current", &*self.current.lock())
            .finish_non_exhaustive()
    }
}

impl SuperBlockStore {
    pub fn new(device: Arc<dyn ByteDevice>, superblock: SuperBlock) -> Self {
        Self {
            device,
            current: Mutex::new(superblock),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SuperBlock {
        self.current.lock().clone()
    }

    #[must_use]
    pub fn log_pointers(&self) -> LogPointers {
        let sb = self.current.lock();
        LogPointers {
            start: sb.log_start,
            end: sb.log_end,
        }
    }

    /// Change the in-memory copy; nothing is written.
    pub fn update(&self, change: impl FnOnce(&mut SuperBlock)) {
        change(&mut self.current.lock());
    }

    /// Write the current superblock to the device.
    pub fn write(&self) -> Result<()> {
        let sb = self.current.lock();
        write_superblock_region(self.device.as_ref(), &encode(&sb)?)
    }
}

impl LogAnchor for SuperBlockStore {
    fn anchor(&self, update: &AnchorUpdate) -> Result<()> {
        let mut sb = self.current.lock();
        sb.log_start = update.pointers.start;
        sb.log_end = update.pointers.end;
        let used = i128::from(sb.used_blocks) + i128::from(update.used_blocks_delta);
        sb.used_blocks = u64::try_from(used.clamp(0, i128::from(sb.num_blocks))).unwrap_or(0);
        sb.set_clean(update.clean);
        write_superblock_region(self.device.as_ref(), &encode(&sb)?)?;
        tracing::trace!(
            target: "bfs::volume",
            log_start = sb.log_start,
            log_end = sb.log_end,
            used_blocks = sb.used_blocks,
            clean = update.clean,
            "superblock_anchored"
        );
        Ok(())
    }
}

fn encode(sb: &SuperBlock) -> Result<[u8; SUPER_BLOCK_SIZE]> {
    sb.to_bytes()
        .map_err(|e| BfsError::Format(format!("superblock {:?}: {e}", sb.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_block::{MemoryByteDevice, read_superblock_region};
    use bfs_types::BlockSize;

    #[test]
    fn anchor_persists_pointers_and_usage() {
        let mem = Arc::new(MemoryByteDevice::new(64 * 1024));
        let device: Arc<dyn ByteDevice> = mem.clone();
        let sb = SuperBlock::initialize("anchor", 64, BlockSize::new(1024).expect("bs"));
        let store = SuperBlockStore::new(device.clone(), sb);

        store
            .anchor(&AnchorUpdate {
                pointers: LogPointers { start: 3, end: 9 },
                used_blocks_delta: 20,
                clean: false,
            })
            .expect("anchor");
        let (on_disk, _) =
            SuperBlock::probe(&read_superblock_region(device.as_ref()).expect("read"))
                .expect("valid");
        assert_eq!((on_disk.log_start, on_disk.log_end), (3, 9));
        assert_eq!(on_disk.used_blocks, 20);
        assert!(!on_disk.is_clean());

        store
            .anchor(&AnchorUpdate {
                pointers: LogPointers { start: 9, end: 9 },
                used_blocks_delta: -500,
                clean: true,
            })
            .expect("anchor");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.used_blocks, 0);
        assert!(snapshot.is_clean());
        assert_eq!(mem.write_count(), 2);
    }

    #[test]
    fn update_touches_memory_only() {
        let mem = Arc::new(MemoryByteDevice::new(64 * 1024));
        let sb = SuperBlock::initialize("mem", 64, BlockSize::new(1024).expect("bs"));
        let store = SuperBlockStore::new(mem.clone(), sb);
        store.update(|sb| sb.used_blocks = 7);
        assert_eq!(mem.write_count(), 0);
        store.write().expect("write");
        assert_eq!(mem.write_count(), 1);
        assert_eq!(store.snapshot().used_blocks, 7);
    }
}
