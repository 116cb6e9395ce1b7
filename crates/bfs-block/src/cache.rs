//! Write-back block cache with ARC (Adaptive Replacement Cache) replacement.

use crate::{BlockBuf, BlockDevice, BlockRead, ByteBlockDevice, ByteDevice};
use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArcList {
    T1,
    T2,
    B1,
    B2,
}

#[derive(Debug)]
struct CachedBlock {
    bytes: Vec<u8>,
    dirty: bool,
}

/// Counters describing cache behaviour since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size for the T1 list.
    p: usize,
    t1: VecDeque<BlockNumber>,
    t2: VecDeque<BlockNumber>,
    b1: VecDeque<BlockNumber>,
    b2: VecDeque<BlockNumber>,
    loc: HashMap<BlockNumber, ArcList>,
    resident: HashMap<BlockNumber, CachedBlock>,
    stats: CacheStats,
}

type Evicted = Vec<(BlockNumber, CachedBlock)>;

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            loc: HashMap::new(),
            resident: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    fn remove_from_list(list: &mut VecDeque<BlockNumber>, key: BlockNumber) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            let _ = list.remove(pos);
            return true;
        }
        false
    }

    fn touch_mru(&mut self, key: BlockNumber) {
        let Some(list) = self.loc.get(&key).copied() else {
            return;
        };

        match list {
            ArcList::T1 => {
                let _ = Self::remove_from_list(&mut self.t1, key);
                self.t2.push_back(key);
                self.loc.insert(key, ArcList::T2);
            }
            ArcList::T2 => {
                let _ = Self::remove_from_list(&mut self.t2, key);
                self.t2.push_back(key);
            }
            ArcList::B1 | ArcList::B2 => {}
        }
    }

    fn evict_resident(&mut self, victim: BlockNumber, evicted: &mut Evicted) {
        if let Some(block) = self.resident.remove(&victim) {
            self.stats.evictions += 1;
            evicted.push((victim, block));
        }
    }

    fn replace(&mut self, incoming: BlockNumber, evicted: &mut Evicted) {
        let t1_len = self.t1.len();
        if t1_len >= 1
            && (t1_len > self.p
                || (matches!(self.loc.get(&incoming), Some(ArcList::B2)) && t1_len == self.p))
        {
            if let Some(victim) = self.t1.pop_front() {
                self.loc.insert(victim, ArcList::B1);
                self.evict_resident(victim, evicted);
                self.b1.push_back(victim);
            }
        } else if let Some(victim) = self.t2.pop_front() {
            self.loc.insert(victim, ArcList::B2);
            self.evict_resident(victim, evicted);
            self.b2.push_back(victim);
        }

        while self.b1.len() > self.capacity {
            if let Some(victim) = self.b1.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(victim) = self.b2.pop_front() {
                let _ = self.loc.remove(&victim);
            }
        }
    }

    /// Admit `key` as a new resident, returning whatever had to leave.
    fn admit(&mut self, key: BlockNumber) -> Evicted {
        let mut evicted = Vec::new();
        if matches!(self.loc.get(&key), Some(ArcList::B1)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b2_len / b1_len).max(1);
            self.p = (self.p + delta).min(self.capacity);
            let _ = Self::remove_from_list(&mut self.b1, key);
            self.replace(key, &mut evicted);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return evicted;
        }

        if matches!(self.loc.get(&key), Some(ArcList::B2)) {
            let b1_len = self.b1.len().max(1);
            let b2_len = self.b2.len().max(1);
            let delta = (b1_len / b2_len).max(1);
            self.p = self.p.saturating_sub(delta);
            let _ = Self::remove_from_list(&mut self.b2, key);
            self.replace(key, &mut evicted);
            self.t2.push_back(key);
            self.loc.insert(key, ArcList::T2);
            return evicted;
        }

        if self.t1.len() + self.b1.len() == self.capacity {
            if self.t1.len() < self.capacity {
                let _ = self.b1.pop_front().and_then(|v| self.loc.remove(&v));
                self.replace(key, &mut evicted);
            } else if let Some(victim) = self.t1.pop_front() {
                let _ = self.loc.remove(&victim);
                self.evict_resident(victim, &mut evicted);
            }
        } else if (self.t1.len() + self.b1.len()) < self.capacity
            && (self.t1.len() + self.t2.len() + self.b1.len() + self.b2.len())
                >= self.capacity.saturating_mul(2)
        {
            let _ = self.b2.pop_front().and_then(|v| self.loc.remove(&v));
        }

        if self.resident.len() >= self.capacity {
            self.replace(key, &mut evicted);
        }
        self.t1.push_back(key);
        self.loc.insert(key, ArcList::T1);
        evicted
    }

    fn forget_all(&mut self) {
        self.p = 0;
        self.t1.clear();
        self.t2.clear();
        self.b1.clear();
        self.b2.clear();
        self.loc.clear();
        self.resident.clear();
    }
}

/// Write-back block cache over a [`BlockDevice`].
///
/// - `read_block` caches whole blocks.
/// - `write_block` only updates the cache and marks the block dirty.
/// - `write_through` updates the device immediately and leaves a clean copy.
/// - A dirty block chosen for eviction is written to the device first.
///
/// All state lives behind one lock; device I/O for write-back happens while
/// it is held so no reader can observe the stale on-device copy in between.
pub struct BlockCache {
    inner: Box<dyn BlockDevice>,
    state: Mutex<ArcState>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("block_size", &self.inner.block_size())
            .field("block_count", &self.inner.block_count())
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    pub fn new(inner: Box<dyn BlockDevice>, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(BfsError::OutOfMemory(
                "block cache capacity must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            state: Mutex::new(ArcState::new(capacity_blocks)),
        })
    }

    /// Create a cache covering `num_blocks` blocks of `device`.
    pub fn init(
        device: Arc<dyn ByteDevice>,
        num_blocks: u64,
        block_size: BlockSize,
        capacity_blocks: usize,
    ) -> Result<Self> {
        let blocks = ByteBlockDevice::new(device, block_size, num_blocks)?;
        tracing::debug!(
            target: "bfs::block",
            num_blocks,
            block_size = block_size.get(),
            capacity_blocks,
            "block_cache_created"
        );
        Self::new(Box::new(blocks), capacity_blocks)
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    pub fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        {
            let mut guard = self.state.lock();
            if let Some(bytes) = guard.resident.get(&block).map(|b| b.bytes.clone()) {
                guard.on_hit(block);
                drop(guard);
                return Ok(BlockBuf::new(bytes));
            }
        }

        let buf = self.inner.read_block(block)?;

        let mut guard = self.state.lock();
        // A writer may have installed a newer copy while the device read ran.
        if let Some(bytes) = guard.resident.get(&block).map(|b| b.bytes.clone()) {
            drop(guard);
            return Ok(BlockBuf::new(bytes));
        }
        guard.stats.misses += 1;
        let evicted = guard.admit(block);
        guard.resident.insert(
            block,
            CachedBlock {
                bytes: buf.as_slice().to_vec(),
                dirty: false,
            },
        );
        self.write_back(&mut guard, evicted)?;
        drop(guard);
        Ok(buf)
    }

    /// Cache `data` as the new content of `block`; the device is written on
    /// flush or eviction.
    pub fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.install(block, data, true)
    }

    /// Write `data` to the device immediately and cache a clean copy.
    pub fn write_through(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.inner.write_block(block, data)?;
        self.install(block, data, false)
    }

    fn install(&self, block: BlockNumber, data: &[u8], dirty: bool) -> Result<()> {
        self.check_len(data)?;
        if block.0 >= self.inner.block_count() {
            return Err(BfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0,
                self.inner.block_count()
            )));
        }
        let mut guard = self.state.lock();
        if let Some(cached) = guard.resident.get_mut(&block) {
            cached.bytes.clear();
            cached.bytes.extend_from_slice(data);
            cached.dirty = dirty;
            guard.on_hit(block);
            return Ok(());
        }
        let evicted = guard.admit(block);
        guard.resident.insert(
            block,
            CachedBlock {
                bytes: data.to_vec(),
                dirty,
            },
        );
        self.write_back(&mut guard, evicted)
    }

    fn check_len(&self, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.inner.block_size())
            .map_err(|_| BfsError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(BfsError::Format(format!(
                "block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        Ok(())
    }

    fn write_back(&self, state: &mut ArcState, evicted: Evicted) -> Result<()> {
        for (block, cached) in evicted {
            if cached.dirty {
                tracing::trace!(target: "bfs::block", block = block.0, "dirty_block_evicted");
                self.inner.write_block(block, &cached.bytes)?;
                state.stats.writebacks += 1;
            }
        }
        Ok(())
    }

    /// Write every dirty block (in block order) and sync the device.
    ///
    /// Returns the number of blocks written.
    pub fn flush(&self) -> Result<usize> {
        let mut guard = self.state.lock();
        let mut dirty: Vec<BlockNumber> = guard
            .resident
            .iter()
            .filter_map(|(block, cached)| cached.dirty.then_some(*block))
            .collect();
        dirty.sort_unstable();
        for block in &dirty {
            if let Some(cached) = guard.resident.get_mut(block) {
                self.inner.write_block(*block, &cached.bytes)?;
                cached.dirty = false;
            }
        }
        guard.stats.writebacks += dirty.len() as u64;
        drop(guard);
        self.inner.sync()?;
        if !dirty.is_empty() {
            tracing::debug!(target: "bfs::block", blocks = dirty.len(), "cache_flushed");
        }
        Ok(dirty.len())
    }

    /// Sync the underlying device without touching cached blocks.
    pub fn sync_device(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Drop every cached block, dirty or not.
    pub fn discard(&self) {
        let mut guard = self.state.lock();
        let dropped_dirty = guard.resident.values().filter(|b| b.dirty).count();
        guard.forget_all();
        drop(guard);
        if dropped_dirty > 0 {
            tracing::warn!(target: "bfs::block", dropped_dirty, "cache_discarded_dirty_blocks");
        }
    }

    /// Tear the cache down, flushing dirty blocks first when `flush` is set.
    pub fn delete(self, flush: bool) -> Result<()> {
        if flush {
            self.flush()?;
        } else {
            self.discard();
        }
        Ok(())
    }

    #[must_use]
    pub fn dirty_blocks(&self) -> usize {
        self.state.lock().resident.values().filter(|b| b.dirty).count()
    }

    #[must_use]
    pub fn resident_blocks(&self) -> usize {
        self.state.lock().resident.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }
}

impl ArcState {
    fn on_hit(&mut self, key: BlockNumber) {
        self.stats.hits += 1;
        self.touch_mru(key);
    }
}

impl BlockRead for BlockCache {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        Self::read_block(self, block)
    }

    fn block_size(&self) -> u32 {
        Self::block_size(self)
    }
}
