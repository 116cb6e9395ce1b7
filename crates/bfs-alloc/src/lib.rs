#![forbid(unsafe_code)]
//! Block allocation.
//!
//! One bitmap covers the whole volume, starting at block 1: bit `b` (byte
//! `b / 8`, bit `b % 8`) is set when linear block `b` is in use. The bitmap
//! is split evenly between allocation groups, `blocks_per_ag` bitmap blocks
//! each, so a group's free space can be searched without touching any other
//! group's bitmap.
//!
//! ## Design
//!
//! 1. **Bitmap**: raw bit manipulation on bitmap byte slices.
//! 2. **AllocGeometry**: group and bitmap layout derived from the superblock.
//! 3. **BlockAllocator**: goal-group allocation through a journal
//!    transaction. Allocation calls are serialized by the transaction, which
//!    holds the journal lock.

use bfs_block::BlockRead;
use bfs_error::{BfsError, Result};
use bfs_journal::Transaction;
use bfs_ondisk::SuperBlock;
use bfs_types::{BlockNumber, BlockRun, GroupNumber, is_dir};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> (idx % 8)) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << (idx % 8));
    }
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_used(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let mut used: u32 = bitmap.iter().take(full_bytes).map(|b| b.count_ones()).sum();
    for idx in (count / 8) * 8..count {
        used += u32::from(bitmap_get(bitmap, idx));
    }
    used
}

/// Find `n` contiguous clear bits among the first `count`, searching from
/// `start` and wrapping to the beginning once.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32, start: u32) -> Option<u32> {
    if n == 0 || n > count {
        return None;
    }
    let scan = |from: u32, to: u32| {
        let mut run_start = from;
        let mut run_len = 0_u32;
        for idx in from..to {
            if bitmap_get(bitmap, idx) {
                run_start = idx + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len >= n {
                    return Some(run_start);
                }
            }
        }
        None
    };
    let start = start.min(count);
    scan(start, count).or_else(|| scan(0, (start + n - 1).min(count)))
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Group and bitmap layout of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocGeometry {
    pub block_size: u32,
    pub num_blocks: u64,
    pub ag_shift: u32,
    pub num_ags: u32,
    /// Bitmap blocks per allocation group.
    pub bitmap_blocks_per_group: u32,
    pub bitmap_blocks: u64,
}

/// First block of the bitmap.
pub const BITMAP_START: BlockNumber = BlockNumber(1);

impl AllocGeometry {
    pub fn from_superblock(sb: &SuperBlock) -> Result<Self> {
        let geo = Self {
            block_size: sb.block_size,
            num_blocks: sb.num_blocks,
            ag_shift: sb.ag_shift,
            num_ags: sb.num_ags,
            bitmap_blocks_per_group: sb.blocks_per_ag,
            bitmap_blocks: sb.bitmap_blocks(),
        };
        if u64::from(geo.bits_per_block()) * u64::from(geo.bitmap_blocks_per_group)
            != geo.blocks_per_group()
        {
            return Err(BfsError::InvalidGeometry(format!(
                "{} bitmap blocks per group do not cover 2^{} blocks",
                geo.bitmap_blocks_per_group, geo.ag_shift
            )));
        }
        if BITMAP_START.0 + geo.bitmap_blocks > geo.num_blocks {
            return Err(BfsError::InvalidGeometry(format!(
                "bitmap of {} blocks does not fit a volume of {} blocks",
                geo.bitmap_blocks, geo.num_blocks
            )));
        }
        Ok(geo)
    }

    #[must_use]
    pub fn bits_per_block(&self) -> u32 {
        self.block_size * 8
    }

    #[must_use]
    pub fn blocks_per_group(&self) -> u64 {
        1_u64 << self.ag_shift
    }

    /// Blocks in `group`; the last group may be short.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        let group_start = u64::from(group.0) << self.ag_shift;
        let remaining = self.num_blocks.saturating_sub(group_start);
        remaining.min(self.blocks_per_group()) as u32
    }

    /// First bitmap block of `group`.
    #[must_use]
    pub fn group_bitmap_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(BITMAP_START.0 + u64::from(group.0) * u64::from(self.bitmap_blocks_per_group))
    }

    /// Bitmap blocks of `group` that actually exist; the last group may
    /// need fewer than `bitmap_blocks_per_group`.
    #[must_use]
    pub fn group_bitmap_len(&self, group: GroupNumber) -> u32 {
        self.blocks_in_group(group).div_ceil(self.bits_per_block())
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn group_of(&self, block: BlockNumber) -> GroupNumber {
        GroupNumber((block.0 >> self.ag_shift) as u32)
    }
}

/// Free space of one allocation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    pub group: GroupNumber,
    pub blocks: u32,
    pub used_blocks: u32,
}

impl GroupStats {
    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.blocks - self.used_blocks
    }
}

// ── Block allocator ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BlockAllocator {
    geo: AllocGeometry,
    initialized: AtomicBool,
}

impl BlockAllocator {
    pub fn new(sb: &SuperBlock) -> Result<Self> {
        Ok(Self {
            geo: AllocGeometry::from_superblock(sb)?,
            initialized: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &AllocGeometry {
        &self.geo
    }

    /// Load the bitmap and count used blocks.
    ///
    /// Returns the counted total when it differs from `recorded_used_blocks`.
    pub fn initialize(
        &self,
        source: &dyn BlockRead,
        recorded_used_blocks: u64,
    ) -> Result<Option<u64>> {
        let used: u64 = self
            .group_stats(source)?
            .iter()
            .map(|stats| u64::from(stats.used_blocks))
            .sum();
        self.initialized.store(true, Ordering::Release);
        tracing::debug!(
            target: "bfs::alloc",
            num_ags = self.geo.num_ags,
            used_blocks = used,
            "allocator_initialized"
        );
        if used == recorded_used_blocks {
            return Ok(None);
        }
        tracing::warn!(
            target: "bfs::alloc",
            recorded = recorded_used_blocks,
            counted = used,
            "used_blocks_mismatch"
        );
        Ok(Some(used))
    }

    /// Zero the whole bitmap, then allocate the reserved prefix
    /// `[0, reserved_end)` through `txn`.
    ///
    /// The zeroing bypasses the log: a fresh volume has nothing to recover.
    pub fn initialize_and_clear_bitmap(
        &self,
        txn: &mut Transaction<'_>,
        reserved_end: BlockNumber,
    ) -> Result<()> {
        let zero = vec![0_u8; self.geo.block_size as usize];
        for i in 0..self.geo.bitmap_blocks {
            txn.cache().write_through(BlockNumber(BITMAP_START.0 + i), &zero)?;
        }
        self.initialized.store(true, Ordering::Release);

        let mut block = 0_u64;
        while block < reserved_end.0 {
            let group = self.geo.group_of(BlockNumber(block));
            let group_start = u64::from(group.0) << self.geo.ag_shift;
            let group_end = group_start + u64::from(self.geo.blocks_in_group(group));
            let end = reserved_end.0.min(group_end);
            #[expect(clippy::cast_possible_truncation)]
            self.mark(txn, group, (block - group_start) as u32, (end - block) as u32, true)?;
            block = end;
        }
        txn.add_used_blocks(i64::try_from(reserved_end.0).unwrap_or(i64::MAX));
        tracing::debug!(target: "bfs::alloc", reserved = reserved_end.0, "bitmap_cleared");
        Ok(())
    }

    /// Allocate the block for a new inode.
    ///
    /// The root (no parent) goes to group 0, directories to the group after
    /// their parent's, everything else next to its parent.
    pub fn allocate_for_inode(
        &self,
        txn: &mut Transaction<'_>,
        parent: Option<BlockRun>,
        mode: u32,
    ) -> Result<BlockRun> {
        let goal = match parent {
            None => 0,
            Some(run) => {
                let group = u32::try_from(run.allocation_group).unwrap_or(0);
                if is_dir(mode) { group + 1 } else { group }
            }
        };
        self.allocate_blocks(txn, GroupNumber(goal % self.geo.num_ags), 1)
    }

    /// Allocate `count` contiguous blocks, starting the search in `goal`
    /// and wrapping through every group.
    pub fn allocate_blocks(
        &self,
        txn: &mut Transaction<'_>,
        goal: GroupNumber,
        count: u16,
    ) -> Result<BlockRun> {
        self.ensure_initialized()?;
        if count == 0 {
            return Err(BfsError::Format("cannot allocate 0 blocks".to_owned()));
        }
        for step in 0..self.geo.num_ags {
            let group = GroupNumber((goal.0 % self.geo.num_ags + step) % self.geo.num_ags);
            let bitmap = self.read_group_bitmap(txn, group)?;
            let Some(start) = bitmap_find_contiguous(
                &bitmap,
                self.geo.blocks_in_group(group),
                u32::from(count),
                0,
            ) else {
                continue;
            };
            self.mark(txn, group, start, u32::from(count), true)?;
            txn.add_used_blocks(i64::from(count));
            let run = BlockRun::new(
                i32::try_from(group.0)
                    .map_err(|_| BfsError::InvalidGeometry("group exceeds i32".to_owned()))?,
                u16::try_from(start)
                    .map_err(|_| BfsError::InvalidGeometry("group offset exceeds u16".to_owned()))?,
                count,
            );
            tracing::trace!(target: "bfs::alloc", %run, "blocks_allocated");
            return Ok(run);
        }
        Err(BfsError::NoSpace)
    }

    /// Release `run`; every block in it must be allocated.
    pub fn free(&self, txn: &mut Transaction<'_>, run: BlockRun) -> Result<()> {
        self.ensure_initialized()?;
        let (group, start) = self.locate(run)?;
        let bitmap = self.read_group_bitmap(txn, group)?;
        if let Some(idx) =
            (start..start + u32::from(run.length)).find(|&idx| !bitmap_get(&bitmap, idx))
        {
            return Err(BfsError::Corruption {
                block: (u64::from(group.0) << self.geo.ag_shift) + u64::from(idx),
                detail: format!("freeing unallocated block in run {run}"),
            });
        }
        self.mark(txn, group, start, u32::from(run.length), false)?;
        txn.add_used_blocks(-i64::from(run.length));
        tracing::trace!(target: "bfs::alloc", %run, "blocks_freed");
        Ok(())
    }

    /// Whether every block of `run` is marked in use.
    pub fn is_allocated(&self, source: &dyn BlockRead, run: BlockRun) -> Result<bool> {
        let (group, start) = self.locate(run)?;
        let bitmap = self.read_group_bitmap(source, group)?;
        Ok((start..start + u32::from(run.length)).all(|idx| bitmap_get(&bitmap, idx)))
    }

    /// Per-group usage, counted from the bitmap.
    pub fn group_stats(&self, source: &dyn BlockRead) -> Result<Vec<GroupStats>> {
        (0..self.geo.num_ags)
            .map(|g| {
                let group = GroupNumber(g);
                let bitmap = self.read_group_bitmap(source, group)?;
                let blocks = self.geo.blocks_in_group(group);
                Ok(GroupStats {
                    group,
                    blocks,
                    used_blocks: bitmap_count_used(&bitmap, blocks),
                })
            })
            .collect()
    }

    pub fn uninitialize(&self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            tracing::debug!(target: "bfs::alloc", "allocator_uninitialized");
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BfsError::InvalidState("block allocator not initialized".to_owned()))
        }
    }

    fn locate(&self, run: BlockRun) -> Result<(GroupNumber, u32)> {
        let group = u32::try_from(run.allocation_group)
            .ok()
            .filter(|g| *g < self.geo.num_ags)
            .ok_or_else(|| BfsError::Corruption {
                block: 0,
                detail: format!("block run {run} names a nonexistent group"),
            })?;
        let group = GroupNumber(group);
        if run.length == 0 || run.end() > self.geo.blocks_in_group(group) {
            return Err(BfsError::Corruption {
                block: 0,
                detail: format!("block run {run} exceeds its group"),
            });
        }
        Ok((group, u32::from(run.start)))
    }

    fn read_group_bitmap(&self, source: &dyn BlockRead, group: GroupNumber) -> Result<Vec<u8>> {
        let first = self.geo.group_bitmap_block(group);
        let len = self.geo.group_bitmap_len(group);
        let mut bitmap = Vec::with_capacity(len as usize * self.geo.block_size as usize);
        for i in 0..u64::from(len) {
            bitmap.extend_from_slice(source.read_block(BlockNumber(first.0 + i))?.as_slice());
        }
        Ok(bitmap)
    }

    /// Set or clear `count` bits of `group` starting at `start`, staging
    /// only the bitmap blocks that change.
    fn mark(
        &self,
        txn: &mut Transaction<'_>,
        group: GroupNumber,
        start: u32,
        count: u32,
        used: bool,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let bits = self.geo.bits_per_block();
        let first = self.geo.group_bitmap_block(group);
        let mut idx = start;
        let end = start + count;
        while idx < end {
            let block_index = idx / bits;
            let block = BlockNumber(first.0 + u64::from(block_index));
            let mut bytes = txn.read_block(block)?.into_inner();
            let block_end = end.min((block_index + 1) * bits);
            for bit in idx..block_end {
                if used {
                    bitmap_set(&mut bytes, bit - block_index * bits);
                } else {
                    bitmap_clear(&mut bytes, bit - block_index * bits);
                }
            }
            txn.write_block(block, &bytes)?;
            idx = block_end;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_block::{BlockCache, ByteDevice, MemoryByteDevice};
    use bfs_journal::{AnchorUpdate, Journal, LogAnchor, LogExtent, LogPointers};
    use bfs_types::{BlockSize, S_IFDIR, S_IFREG};
    use proptest::prelude::*;
    use std::sync::Arc;

    struct NullAnchor;

    impl LogAnchor for NullAnchor {
        fn anchor(&self, _update: &AnchorUpdate) -> Result<()> {
            Ok(())
        }
    }

    /// 1K blocks, 3 groups of 8192 blocks, the last one short.
    fn volume() -> (SuperBlock, Journal) {
        let num_blocks = 8192 * 2 + 4000;
        let sb = SuperBlock::initialize("alloc", num_blocks, BlockSize::new(1024).unwrap());
        assert_eq!(sb.num_ags, 3);
        let mem: Arc<dyn ByteDevice> =
            Arc::new(MemoryByteDevice::new(usize::try_from(num_blocks).unwrap() * 1024));
        let cache =
            BlockCache::init(mem, num_blocks, BlockSize::new(1024).unwrap(), 256).expect("cache");
        let journal = Journal::new(
            Arc::new(cache),
            LogExtent {
                first_block: BlockNumber(4),
                length: 512,
            },
            LogPointers::default(),
            Arc::new(NullAnchor),
        );
        (sb, journal)
    }

    fn formatted(sb: &SuperBlock, journal: &Journal) -> BlockAllocator {
        let alloc = BlockAllocator::new(sb).expect("allocator");
        let mut txn = journal.begin().expect("begin");
        alloc
            .initialize_and_clear_bitmap(&mut txn, BlockNumber(516))
            .expect("clear");
        assert_eq!(txn.used_blocks_delta(), 516);
        txn.done().expect("commit");
        alloc
    }

    #[test]
    fn bitmap_helpers() {
        let mut bitmap = vec![0_u8; 4];
        bitmap_set(&mut bitmap, 0);
        bitmap_set(&mut bitmap, 9);
        assert!(bitmap_get(&bitmap, 9));
        assert_eq!(bitmap_count_used(&bitmap, 32), 2);
        assert_eq!(bitmap_count_used(&bitmap, 9), 1);
        bitmap_clear(&mut bitmap, 9);
        assert!(!bitmap_get(&bitmap, 9));
        assert!(!bitmap_get(&bitmap, 1000));
        assert_eq!(bitmap_find_contiguous(&bitmap, 32, 4, 0), Some(1));
        bitmap_set(&mut bitmap, 3);
        assert_eq!(bitmap_find_contiguous(&bitmap, 32, 4, 0), Some(4));
        assert_eq!(bitmap_find_contiguous(&bitmap, 32, 40, 0), None);
    }

    #[test]
    fn find_contiguous_wraps_from_start_hint() {
        let mut bitmap = vec![0xFF_u8; 2];
        bitmap_clear(&mut bitmap, 2);
        bitmap_clear(&mut bitmap, 3);
        assert_eq!(bitmap_find_contiguous(&bitmap, 16, 2, 10), Some(2));
    }

    #[test]
    fn geometry_matches_superblock() {
        let (sb, journal) = volume();
        let alloc = BlockAllocator::new(&sb).expect("allocator");
        let geo = alloc.geometry();
        assert_eq!(geo.bits_per_block(), 8192);
        assert_eq!(geo.blocks_in_group(GroupNumber(2)), 4000);
        assert_eq!(geo.group_bitmap_block(GroupNumber(2)), BlockNumber(3));
        assert_eq!(geo.group_bitmap_len(GroupNumber(2)), 1);
        assert_eq!(geo.group_of(BlockNumber(8192)), GroupNumber(1));
        journal.set_read_only(true);
    }

    #[test]
    fn operations_require_initialization() {
        let (sb, journal) = volume();
        let alloc = BlockAllocator::new(&sb).expect("allocator");
        let mut txn = journal.begin().expect("begin");
        assert!(matches!(
            alloc.allocate_blocks(&mut txn, GroupNumber(0), 1),
            Err(BfsError::InvalidState(_))
        ));
    }

    #[test]
    fn clear_reserves_prefix_and_initialize_counts_it() {
        let (sb, journal) = volume();
        let alloc = formatted(&sb, &journal);
        let cache = journal.cache().as_ref();
        assert!(alloc.is_allocated(cache, BlockRun::new(0, 0, 516)).expect("check"));
        assert!(!alloc.is_allocated(cache, BlockRun::new(0, 516, 1)).expect("check"));

        let fresh = BlockAllocator::new(&sb).expect("allocator");
        assert_eq!(fresh.initialize(cache, 516).expect("init"), None);
        assert_eq!(fresh.initialize(cache, 3).expect("init"), Some(516));
    }

    #[test]
    fn inode_placement_follows_parent_group() {
        let (sb, journal) = volume();
        let alloc = formatted(&sb, &journal);
        let mut txn = journal.begin().expect("begin");

        let root = alloc.allocate_for_inode(&mut txn, None, S_IFDIR).expect("root");
        assert_eq!(root, BlockRun::new(0, 516, 1));
        let dir = alloc.allocate_for_inode(&mut txn, Some(root), S_IFDIR).expect("dir");
        assert_eq!(dir.allocation_group, 1);
        let file = alloc.allocate_for_inode(&mut txn, Some(dir), S_IFREG).expect("file");
        assert_eq!(file.allocation_group, 1);
        let wrapped = alloc
            .allocate_for_inode(&mut txn, Some(BlockRun::new(2, 0, 1)), S_IFDIR)
            .expect("wrapped");
        assert_eq!(wrapped.allocation_group, 0);
        assert_eq!(txn.used_blocks_delta(), 4);
        txn.done().expect("commit");
    }

    #[test]
    fn full_group_spills_into_next() {
        let (sb, journal) = volume();
        let alloc = formatted(&sb, &journal);
        let mut txn = journal.begin().expect("begin");
        // Group 2 holds 4000 blocks.
        let big = alloc.allocate_blocks(&mut txn, GroupNumber(2), 4000).expect("fill");
        assert_eq!(big, BlockRun::new(2, 0, 4000));
        let next = alloc.allocate_blocks(&mut txn, GroupNumber(2), 1).expect("spill");
        assert_eq!(next.allocation_group, 0);
        assert!(matches!(
            alloc.allocate_blocks(&mut txn, GroupNumber(0), 9000),
            Err(BfsError::NoSpace)
        ));
    }

    #[test]
    fn free_releases_and_detects_double_free() {
        let (sb, journal) = volume();
        let alloc = formatted(&sb, &journal);
        let mut txn = journal.begin().expect("begin");
        let run = alloc.allocate_blocks(&mut txn, GroupNumber(1), 8).expect("alloc");
        alloc.free(&mut txn, run).expect("free");
        assert_eq!(txn.used_blocks_delta(), 0);
        assert!(!alloc.is_allocated(&txn, run).expect("check"));
        let err = alloc.free(&mut txn, run).expect_err("double free");
        assert!(err.is_corruption());
        assert!(alloc.free(&mut txn, BlockRun::new(7, 0, 1)).is_err());
        assert!(alloc.free(&mut txn, BlockRun::new(2, 3999, 2)).is_err());
    }

    #[test]
    fn group_stats_account_for_allocations() {
        let (sb, journal) = volume();
        let alloc = formatted(&sb, &journal);
        let mut txn = journal.begin().expect("begin");
        alloc.allocate_blocks(&mut txn, GroupNumber(1), 10).expect("alloc");
        txn.done().expect("commit");
        let stats = alloc.group_stats(journal.cache().as_ref()).expect("stats");
        assert_eq!(stats[0].used_blocks, 516);
        assert_eq!(stats[1].used_blocks, 10);
        assert_eq!(stats[2].free_blocks(), 4000);
        alloc.uninitialize();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn allocations_never_overlap(sizes in proptest::collection::vec(1_u16..300, 1..20)) {
            let (sb, journal) = volume();
            let alloc = formatted(&sb, &journal);
            let mut txn = journal.begin().expect("begin");
            let mut seen = std::collections::BTreeSet::new();
            for (i, size) in sizes.iter().enumerate() {
                let goal = GroupNumber(u32::try_from(i).unwrap() % 3);
                let run = alloc.allocate_blocks(&mut txn, goal, *size).expect("alloc");
                let first = run.to_block(sb.ag_shift).expect("block").0;
                prop_assert!(first >= 516);
                for block in first..first + u64::from(*size) {
                    prop_assert!(seen.insert(block), "block {} handed out twice", block);
                }
            }
        }
    }
}
