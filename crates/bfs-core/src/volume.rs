//! The mounted volume.

use crate::check::{CheckReport, CheckVisitor};
use crate::format::{
    LEGACY_BOOT_OFFSET, create_indices_root, create_volume_id, erase_unused_boot_block,
};
use crate::node::{NodePublisher, NodeTable};
use crate::options::{DegradedReason, MountOptions, MountReport};
use crate::superblock_store::SuperBlockStore;
use bfs_alloc::BlockAllocator;
use bfs_block::{BlockCache, BlockRead, ByteDevice, FileByteDevice, read_superblock_region};
use bfs_error::{BfsError, Result};
use bfs_inode::{Attribute, AttributeUpdate, CreateMode, Index, Inode, InodeContext};
use bfs_journal::{Journal, LogAnchor, LogExtent, Transaction};
use bfs_ondisk::{DirEntry, SmallData, SuperBlock, SuperBlockLocation};
use bfs_query::{AttributeChange, LiveQuery, LiveQueryHandle, QueryRegistry, RenameMove};
use bfs_types::{BlockNumber, BlockRun, BlockSize, InodeId, S_IFDIR, S_IFREG, TxnId, TypeCode};
use parking_lot::{RwLock, RwLockReadGuard};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether `run` lies inside the allocation-group geometry.
///
/// The group must exist, the run must be non-empty and it must end within
/// its group.
#[must_use]
pub fn block_run_in_bounds(run: BlockRun, num_ags: u32, ag_shift: u32) -> bool {
    let group_size = 1_u64 << ag_shift.min(63);
    u32::try_from(run.allocation_group).is_ok_and(|group| group < num_ags)
        && run.length != 0
        && u64::from(run.end()) <= group_size
}

/// A mounted BFS volume.
///
/// Owns the superblock, journal, allocator and the indices directory. The
/// root directory is shared with the node publisher, which holds the
/// volume's reference until [`Volume::unmount`]. Live queries are only
/// referenced, never owned.
///
/// Read-only is one-way: once set by the mount options, a degraded mount
/// or [`Volume::panic`], it stays set for the life of the volume.
pub struct Volume {
    device: Arc<dyn ByteDevice>,
    superblock: Arc<SuperBlockStore>,
    block_size: BlockSize,
    ag_shift: u32,
    num_ags: u32,
    num_blocks: u64,
    reserved_end: BlockNumber,
    read_only: AtomicBool,
    booting: bool,
    journal: Journal,
    allocator: BlockAllocator,
    root: Arc<Inode>,
    indices: RwLock<Option<Arc<Inode>>>,
    nodes: Arc<dyn NodePublisher>,
    queries: Arc<QueryRegistry>,
    check: RwLock<Option<CheckVisitor>>,
    report: MountReport,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .field("num_ags", &self.num_ags)
            .field("read_only", &self.is_read_only())
            .field("root", &self.root.id())
            .field("queries", &self.queries)
            .finish_non_exhaustive()
    }
}

impl Volume {
    // ── Mount / unmount ─────────────────────────────────────────────────────

    /// Mount the image or device at `path`.
    pub fn mount(path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let path = path.as_ref();
        let device: Arc<dyn ByteDevice> = if options.read_only {
            Arc::new(FileByteDevice::open_read_only(path)?)
        } else {
            Arc::new(FileByteDevice::open(path)?)
        };
        Self::mount_device(device, options)
    }

    /// Mount an already opened device, publishing nodes into a fresh
    /// [`NodeTable`].
    pub fn mount_device(device: Arc<dyn ByteDevice>, options: &MountOptions) -> Result<Self> {
        Self::mount_with_publisher(device, options, Arc::new(NodeTable::new()))
    }

    /// Mount an already opened device, publishing the root through `nodes`.
    ///
    /// Every failure after the journal exists leaves it read-only, so a
    /// refused mount writes nothing on the way out.
    #[expect(clippy::too_many_lines)]
    pub fn mount_with_publisher(
        device: Arc<dyn ByteDevice>,
        options: &MountOptions,
        nodes: Arc<dyn NodePublisher>,
    ) -> Result<Self> {
        let mut degraded = Vec::new();
        let mut read_only = options.read_only;
        if device.is_read_only() && !read_only {
            tracing::info!(target: "bfs::volume", "device_opened_read_only");
            degraded.push(DegradedReason::DeviceReadOnly);
            read_only = true;
        }
        if cfg!(target_endian = "big") {
            // Volumes are little-endian; other hosts only read them.
            degraded.push(DegradedReason::ForeignByteOrder);
            read_only = true;
        }

        let (sb, location) = Self::identify(device.as_ref())?;
        let block_size =
            BlockSize::new(sb.block_size).map_err(|e| BfsError::InvalidSuperblock(e.to_string()))?;
        let fs_bytes = sb
            .num_blocks
            .checked_mul(u64::from(sb.block_size))
            .ok_or_else(|| BfsError::InvalidGeometry("volume size overflows u64".to_owned()))?;
        if device.len_bytes() < fs_bytes {
            return Err(BfsError::DeviceTooSmall {
                device_bytes: device.len_bytes(),
                fs_bytes,
            });
        }
        let log_first = sb.log_first_block().ok_or_else(|| {
            BfsError::InvalidGeometry(format!("log run {} is not addressable", sb.log_blocks))
        })?;
        let reserved_end = sb.reserved_end().ok_or_else(|| {
            BfsError::InvalidGeometry(format!("log run {} is not addressable", sb.log_blocks))
        })?;

        let superblock = Arc::new(SuperBlockStore::new(Arc::clone(&device), sb.clone()));
        let cache = Arc::new(BlockCache::init(
            Arc::clone(&device),
            sb.num_blocks,
            block_size,
            options.cache_blocks,
        )?);
        let anchor: Arc<dyn LogAnchor> = superblock.clone();
        let journal = Journal::new(
            Arc::clone(&cache),
            LogExtent {
                first_block: log_first,
                length: u64::from(sb.log_blocks.length),
            },
            superblock.log_pointers(),
            anchor,
        );
        journal.set_read_only(read_only);
        let unwind = |err: BfsError| {
            journal.set_read_only(true);
            err
        };
        journal.init_check().map_err(unwind)?;

        let mut replay = None;
        if read_only {
            if !journal.pointers().is_empty() {
                tracing::warn!(
                    target: "bfs::volume",
                    log_start = sb.log_start,
                    log_end = sb.log_end,
                    "journal_replay_skipped"
                );
            }
        } else {
            match journal.replay_log() {
                Ok(report) => replay = Some(report),
                Err(err) => {
                    tracing::error!(target: "bfs::volume", error = %err, "journal_replay_failed");
                    degraded.push(DegradedReason::JournalReplayFailed {
                        detail: err.to_string(),
                    });
                    read_only = true;
                    journal.set_read_only(true);
                }
            }
        }

        let allocator = BlockAllocator::new(&sb).map_err(unwind)?;
        let corrected_used_blocks = allocator
            .initialize(cache.as_ref(), superblock.snapshot().used_blocks)
            .map_err(unwind)?;
        if let Some(used) = corrected_used_blocks {
            if !read_only {
                superblock.update(|sb| sb.used_blocks = used);
            }
        }

        let root = match load_directory(cache.as_ref(), &sb, sb.root_dir) {
            Ok(root) => Arc::new(root),
            Err(err) => {
                tracing::error!(target: "bfs::volume", error = %err, "root_directory_invalid");
                allocator.uninitialize();
                return Err(unwind(err));
            }
        };
        if let Err(err) = nodes.publish(root.id(), Arc::clone(&root), root.mode()) {
            allocator.uninitialize();
            return Err(unwind(err));
        }

        let indices = if sb.has_indices() {
            match load_directory(cache.as_ref(), &sb, sb.indices) {
                Ok(indices) => Some(Arc::new(indices)),
                Err(err) => {
                    tracing::info!(target: "bfs::volume", reason = %err, "indices_unavailable");
                    degraded.push(DegradedReason::IndicesUnavailable {
                        detail: err.to_string(),
                    });
                    read_only = true;
                    None
                }
            }
        } else {
            None
        };
        journal.set_read_only(read_only);

        let report = MountReport {
            superblock_offset: location.byte_offset(),
            read_only,
            degraded,
            replay,
            corrected_used_blocks,
        };
        tracing::info!(
            target: "bfs::volume",
            name = %sb.name,
            block_size = sb.block_size,
            num_blocks = sb.num_blocks,
            read_only,
            degraded = report.degraded.len(),
            "volume_mounted"
        );
        Ok(Self {
            device,
            superblock,
            block_size,
            ag_shift: sb.ag_shift,
            num_ags: sb.num_ags,
            num_blocks: sb.num_blocks,
            reserved_end,
            read_only: AtomicBool::new(read_only),
            booting: options.booting,
            journal,
            allocator,
            root,
            indices: RwLock::new(indices),
            nodes,
            queries: Arc::new(QueryRegistry::new()),
            check: RwLock::new(None),
            report,
        })
    }

    /// Release the root, stop the allocator, flush the journal and the
    /// cache, and close the device.
    pub fn unmount(self) -> Result<()> {
        let read_only = self.is_read_only();
        let Self {
            journal,
            allocator,
            root,
            indices,
            nodes,
            superblock,
            ..
        } = self;

        nodes.put(root.id())?;
        drop(root);
        allocator.uninitialize();

        let cache = Arc::clone(journal.cache());
        journal.flush_log_and_blocks()?;
        journal.set_read_only(true);
        drop(journal);
        drop(indices);

        if read_only {
            cache.discard();
        } else {
            cache.flush()?;
        }
        tracing::info!(
            target: "bfs::volume",
            name = %superblock.snapshot().name,
            read_only,
            "volume_unmounted"
        );
        Ok(())
    }

    /// Flush the log and every dirty block.
    pub fn sync(&self) -> Result<()> {
        self.journal.flush_log_and_blocks()
    }

    /// Read and validate the superblock of `device`, trying byte 512 and
    /// then byte 0.
    pub fn identify(device: &dyn ByteDevice) -> Result<(SuperBlock, SuperBlockLocation)> {
        let region = read_superblock_region(device)?;
        let (sb, location) = SuperBlock::probe(&region).map_err(|e| {
            tracing::warn!(target: "bfs::volume", error = %e, "superblock_invalid");
            BfsError::InvalidSuperblock(e.to_string())
        })?;
        if location == SuperBlockLocation::Alternate {
            tracing::warn!(target: "bfs::volume", "superblock_at_alternate_location");
        }
        Ok((sb, location))
    }

    // ── State ───────────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_booting(&self) -> bool {
        self.booting
    }

    /// Whether the volume has a usable indices directory.
    #[must_use]
    pub fn has_indices(&self) -> bool {
        self.indices.read().is_some()
    }

    #[must_use]
    pub fn mount_report(&self) -> &MountReport {
        &self.report
    }

    /// Copy of the in-memory superblock.
    #[must_use]
    pub fn superblock(&self) -> SuperBlock {
        self.superblock.snapshot()
    }

    #[must_use]
    pub fn root(&self) -> &Arc<Inode> {
        &self.root
    }

    #[must_use]
    pub fn nodes(&self) -> &Arc<dyn NodePublisher> {
        &self.nodes
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn block_shift(&self) -> u32 {
        self.block_size.shift()
    }

    #[must_use]
    pub fn ag_shift(&self) -> u32 {
        self.ag_shift
    }

    #[must_use]
    pub fn num_ags(&self) -> u32 {
        self.num_ags
    }

    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub(crate) fn cache(&self) -> &BlockCache {
        self.journal.cache()
    }

    pub(crate) fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub(crate) fn indices(&self) -> Option<Arc<Inode>> {
        self.indices.read().clone()
    }

    /// Force the volume read-only after detecting corrupt metadata.
    ///
    /// The journal stops flushing, so nothing more reaches the device. With
    /// the `debug-halt` feature the process halts here for inspection.
    pub fn panic(&self) {
        self.read_only.store(true, Ordering::Release);
        self.journal.set_read_only(true);
        tracing::error!(
            target: "bfs::volume",
            name = %self.superblock.snapshot().name,
            "volume_panic"
        );
        if cfg!(feature = "debug-halt") {
            panic!("bfs: volume panic, halting for inspection");
        }
    }

    // ── Block addressing ────────────────────────────────────────────────────

    /// Check a block run read from disk, panicking the volume if it does not
    /// fit the group geometry.
    pub fn validate_block_run(&self, run: BlockRun) -> Result<()> {
        if block_run_in_bounds(run, self.num_ags, self.ag_shift) {
            return Ok(());
        }
        tracing::error!(
            target: "bfs::volume",
            %run,
            num_ags = self.num_ags,
            ag_shift = self.ag_shift,
            "invalid_block_run"
        );
        self.panic();
        Err(BfsError::Corruption {
            block: run.to_block(self.ag_shift).map_or(0, |block| block.0),
            detail: format!("invalid block run {run}"),
        })
    }

    #[must_use]
    pub fn to_block_run(&self, block: BlockNumber) -> BlockRun {
        BlockRun::from_block(block, self.ag_shift)
    }

    #[must_use]
    pub fn to_block(&self, run: BlockRun) -> Option<BlockNumber> {
        run.to_block(self.ag_shift)
    }

    /// Whether `block` may hold an inode: past the log and inside the volume.
    #[must_use]
    pub fn is_valid_inode_block(&self, block: BlockNumber) -> bool {
        block >= self.reserved_end && block.0 < self.num_blocks
    }

    /// Load and check the inode stored at `id`.
    pub fn load_inode(&self, source: &dyn BlockRead, id: InodeId) -> Result<Inode> {
        let block = BlockNumber::from(id);
        self.validate_block_run(self.to_block_run(block))?;
        if !self.is_valid_inode_block(block) {
            return Err(BfsError::Corruption {
                block: block.0,
                detail: "block cannot hold an inode".to_owned(),
            });
        }
        let inode = Inode::load(source, self.ag_shift, id)?;
        inode.init_check()?;
        Ok(inode)
    }

    // ── Transactions ────────────────────────────────────────────────────────

    /// Start a transaction.
    ///
    /// Fails with `ReadOnly` on a read-only volume and with `Busy` while a
    /// check visitor exists. Creating a check visitor waits for open
    /// transactions to finish.
    pub fn begin_transaction(&self) -> Result<VolumeTransaction<'_>> {
        if self.is_read_only() {
            return Err(BfsError::ReadOnly);
        }
        let check = self.check.read();
        if check.is_some() {
            return Err(BfsError::Busy("consistency check in progress".to_owned()));
        }
        let txn = self.journal.begin()?;
        let ctx = InodeContext::new(&self.allocator)?;
        Ok(VolumeTransaction {
            volume: self,
            txn,
            ctx,
            pending: Vec::new(),
            new_indices: None,
            _check: check,
        })
    }

    /// Allocate the block for a new inode next to `parent`.
    pub fn allocate_for_inode(
        &self,
        txn: &mut Transaction<'_>,
        parent: Option<BlockRun>,
        mode: u32,
    ) -> Result<BlockRun> {
        if self.is_read_only() {
            return Err(BfsError::ReadOnly);
        }
        if let Some(parent) = parent {
            self.validate_block_run(parent)?;
        }
        self.allocator.allocate_for_inode(txn, parent, mode)
    }

    /// Zero the legacy boot-sector regions. With 1024-byte blocks offset
    /// 1024 holds the live bitmap and is left alone.
    pub fn erase_unused_boot_block(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(BfsError::ReadOnly);
        }
        let keep_legacy = u64::from(self.block_size.get()) <= LEGACY_BOOT_OFFSET;
        erase_unused_boot_block(self.device.as_ref(), keep_legacy)
    }

    /// Write the in-memory superblock at byte 512.
    pub fn write_super_block(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(BfsError::ReadOnly);
        }
        self.superblock.write()
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub fn entries(&self, dir: InodeId) -> Result<Vec<DirEntry>> {
        self.load_inode(self.cache(), dir)?.entries(self.cache())
    }

    pub fn lookup(&self, dir: InodeId, name: &str) -> Result<Option<InodeId>> {
        self.load_inode(self.cache(), dir)?.lookup(self.cache(), name)
    }

    pub fn read_attribute(&self, inode: InodeId, name: &str) -> Result<Option<SmallData>> {
        let inode = self.load_inode(self.cache(), inode)?;
        Attribute::new(&inode).read(self.cache(), name)
    }

    /// Names of the indices in the indices directory, empty without one.
    pub fn index_names(&self) -> Result<Vec<String>> {
        let Some(indices) = self.indices() else {
            return Ok(Vec::new());
        };
        Ok(indices
            .entries(self.cache())?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    pub fn open_index(&self, name: &str) -> Result<Index> {
        let indices = self
            .indices()
            .ok_or_else(|| BfsError::NotFound("indices directory".to_owned()))?;
        Index::open(self.cache(), &indices, name)
    }

    // ── Live queries ────────────────────────────────────────────────────────

    pub fn add_query(&self, query: &Arc<dyn LiveQuery>) -> bool {
        self.queries.add(query)
    }

    pub fn remove_query(&self, query: &Arc<dyn LiveQuery>) -> bool {
        self.queries.remove(query)
    }

    /// Register `query` until the returned handle is dropped.
    pub fn open_query(&self, query: Arc<dyn LiveQuery>) -> LiveQueryHandle {
        self.queries.open(query)
    }

    #[must_use]
    pub fn check_for_live_query(&self, attribute: &str) -> bool {
        self.queries.check_for_live_query(attribute)
    }

    pub fn update_live_queries(&self, change: &AttributeChange) -> usize {
        self.queries.update_live_queries(change)
    }

    pub fn update_live_queries_rename_move(&self, change: &RenameMove) -> usize {
        self.queries.update_live_queries_rename_move(change)
    }

    // ── Consistency check ───────────────────────────────────────────────────

    /// Install a check visitor. New transactions fail `Busy` until it is
    /// deleted.
    pub fn create_check_visitor(&self) -> Result<()> {
        let mut check = self.check.write();
        if check.is_some() {
            return Err(BfsError::Busy("check visitor already exists".to_owned()));
        }
        *check = Some(CheckVisitor::new());
        tracing::debug!(target: "bfs::volume", "check_visitor_created");
        Ok(())
    }

    pub fn run_check(&self) -> Result<CheckReport> {
        let mut check = self.check.write();
        let visitor = check
            .as_mut()
            .ok_or_else(|| BfsError::InvalidState("no check visitor".to_owned()))?;
        visitor.run(self)
    }

    /// Remove the check visitor, returning its last report.
    pub fn delete_check_visitor(&self) -> Result<Option<CheckReport>> {
        let visitor = self
            .check
            .write()
            .take()
            .ok_or_else(|| BfsError::InvalidState("no check visitor".to_owned()))?;
        tracing::debug!(target: "bfs::volume", "check_visitor_deleted");
        Ok(visitor.into_report())
    }
}

/// Load a directory inode a superblock points at.
fn load_directory(source: &dyn BlockRead, sb: &SuperBlock, run: BlockRun) -> Result<Inode> {
    if !block_run_in_bounds(run, sb.num_ags, sb.ag_shift) {
        return Err(BfsError::Corruption {
            block: 0,
            detail: format!("directory run {run} outside the volume"),
        });
    }
    let inode = Inode::load_run(source, sb.ag_shift, run)?;
    inode.init_check()?;
    if !inode.is_container() {
        return Err(BfsError::Corruption {
            block: inode.id().0,
            detail: format!("inode {} is not a directory", inode.id()),
        });
    }
    Ok(inode)
}

// ── Volume transaction ──────────────────────────────────────────────────────

enum Notification {
    Attribute(AttributeChange),
    RenameMove(RenameMove),
}

/// A journal transaction bound to a mounted volume.
///
/// Live-query notifications for the changes made through it are queued and
/// delivered only after [`VolumeTransaction::done`] commits. Dropping it
/// aborts the transaction and discards the notifications.
pub struct VolumeTransaction<'v> {
    volume: &'v Volume,
    txn: Transaction<'v>,
    ctx: InodeContext<'v>,
    pending: Vec<Notification>,
    new_indices: Option<Arc<Inode>>,
    _check: RwLockReadGuard<'v, Option<CheckVisitor>>,
}

impl std::fmt::Debug for VolumeTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeTransaction")
            .field("txn", &self.txn)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<'v> VolumeTransaction<'v> {
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.txn.id()
    }

    /// The underlying journal transaction.
    pub fn transaction(&mut self) -> &mut Transaction<'v> {
        &mut self.txn
    }

    pub fn create_directory(&mut self, parent: InodeId, name: &str) -> Result<Inode> {
        self.create(parent, name, S_IFDIR | 0o755)
    }

    pub fn create_file(&mut self, parent: InodeId, name: &str) -> Result<Inode> {
        self.create(parent, name, S_IFREG | 0o644)
    }

    fn create(&mut self, parent: InodeId, name: &str, mode: u32) -> Result<Inode> {
        let parent = self.volume.load_inode(&self.txn, parent)?;
        self.volume.validate_block_run(parent.block_run())?;
        Inode::create(&mut self.txn, &self.ctx, Some(&parent), name, mode)
    }

    pub fn allocate_for_inode(&mut self, parent: Option<BlockRun>, mode: u32) -> Result<BlockRun> {
        self.volume.allocate_for_inode(&mut self.txn, parent, mode)
    }

    /// Replace the value of attribute `name` on `inode`, creating it if
    /// needed.
    pub fn write_attribute(
        &mut self,
        inode: InodeId,
        name: &str,
        type_code: TypeCode,
        value: &[u8],
    ) -> Result<AttributeUpdate> {
        let inode = self.volume.load_inode(&self.txn, inode)?;
        let attribute = Attribute::new(&inode);
        let mut cookie =
            attribute.create(&mut self.txn, &self.ctx, name, type_code, CreateMode::Truncate)?;
        let update = attribute.write(&mut self.txn, &self.ctx, &mut cookie, 0, value)?;
        if self.volume.check_for_live_query(name) {
            self.pending.push(Notification::Attribute(AttributeChange {
                inode: update.inode,
                attribute: update.name.clone(),
                type_code: update.type_code,
                old: update.old.clone(),
                new: Some(update.new.clone()),
            }));
        }
        Ok(update)
    }

    pub fn remove_attribute(&mut self, inode: InodeId, name: &str) -> Result<()> {
        let inode = self.volume.load_inode(&self.txn, inode)?;
        let removed = Attribute::new(&inode).remove(&mut self.txn, &self.ctx, name)?;
        if self.volume.check_for_live_query(name) {
            self.pending.push(Notification::Attribute(AttributeChange {
                inode: inode.id(),
                attribute: removed.name,
                type_code: removed.type_code,
                old: Some(removed.value),
                new: None,
            }));
        }
        Ok(())
    }

    /// Move the entry `old_name` of `old_parent` to `new_name` in
    /// `new_parent`. Fails with `Exists` if the target name is taken.
    pub fn rename(
        &mut self,
        old_parent: InodeId,
        old_name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<InodeId> {
        let from = self.volume.load_inode(&self.txn, old_parent)?;
        let to = if new_parent == old_parent {
            from.clone()
        } else {
            self.volume.load_inode(&self.txn, new_parent)?
        };
        let moved = from.remove(&mut self.txn, &self.ctx, old_name)?;
        to.insert(&mut self.txn, &self.ctx, new_name, moved)?;
        if new_parent != old_parent {
            let inode = self.volume.load_inode(&self.txn, moved)?;
            inode.reparent(&mut self.txn, &self.ctx, &to)?;
        }
        self.pending.push(Notification::RenameMove(RenameMove {
            inode: moved,
            old_parent,
            old_name: old_name.to_owned(),
            new_parent,
            new_name: new_name.to_owned(),
        }));
        Ok(moved)
    }

    /// Create the indices directory. It is recorded in the superblock when
    /// the transaction commits.
    pub fn create_indices_root(&mut self) -> Result<Arc<Inode>> {
        if self.current_indices().is_some() {
            return Err(BfsError::Exists);
        }
        let indices = Arc::new(create_indices_root(&mut self.txn, &self.ctx)?);
        self.new_indices = Some(Arc::clone(&indices));
        Ok(indices)
    }

    /// Create an index, creating the indices directory first if the volume
    /// has none.
    pub fn create_index(&mut self, name: &str, type_code: TypeCode) -> Result<Index> {
        let indices = match self.current_indices() {
            Some(indices) => indices,
            None => self.create_indices_root()?,
        };
        Index::create(&mut self.txn, &self.ctx, &indices, name, type_code)
    }

    /// Give the root directory a fresh random volume id.
    pub fn create_volume_id(&mut self) -> Result<u64> {
        let root = Arc::clone(&self.volume.root);
        create_volume_id(&mut self.txn, &self.ctx, &root, &mut rand::thread_rng())
    }

    fn current_indices(&self) -> Option<Arc<Inode>> {
        self.new_indices.clone().or_else(|| self.volume.indices())
    }

    /// Commit, then notify live queries of the committed changes.
    ///
    /// Notifications go out before the journal lock is released, so queries
    /// see changes in commit order.
    pub fn done(self) -> Result<TxnId> {
        let Self {
            volume,
            txn,
            pending,
            new_indices,
            ..
        } = self;

        if let Some(indices) = &new_indices {
            volume
                .superblock
                .update(|sb| sb.indices = indices.block_run());
        }
        let committed = txn.done_then(|_| {
            if let Some(indices) = &new_indices {
                *volume.indices.write() = Some(Arc::clone(indices));
            }
            for notification in &pending {
                match notification {
                    Notification::Attribute(change) => volume.update_live_queries(change),
                    Notification::RenameMove(change) => {
                        volume.update_live_queries_rename_move(change)
                    }
                };
            }
        });
        match committed {
            Ok((id, ())) => {
                if let Some(indices) = new_indices {
                    tracing::info!(
                        target: "bfs::volume",
                        indices = indices.id().0,
                        "indices_created"
                    );
                }
                Ok(id)
            }
            Err(err) => {
                if new_indices.is_some() {
                    volume.superblock.update(|sb| sb.indices = BlockRun::ZERO);
                }
                Err(err)
            }
        }
    }
}
