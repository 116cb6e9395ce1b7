#![forbid(unsafe_code)]
//! Inodes and directories.
//!
//! An inode occupies exactly one block and its id is that block's linear
//! number. A directory's entries form a single name-sorted stream spread
//! over the direct runs of its data stream; the stream grows one block at a
//! time.
//!
//! Every read takes a [`BlockRead`] source so that callers inside a
//! transaction see their own staged writes. [`Inode`] keeps the block it
//! was loaded from only for identity checks; directory and attribute
//! operations always re-read the inode block.

mod attribute;
mod index;

pub use attribute::{Attribute, AttributeCookie, AttributeUpdate, CreateMode};
pub use index::Index;

use bfs_alloc::BlockAllocator;
use bfs_block::BlockRead;
use bfs_error::{BfsError, Result};
use bfs_journal::Transaction;
use bfs_ondisk::{
    DirEntry, DiskInode, encode_dir_stream, encode_time, parse_dir_stream, validate_name,
};
use bfs_types::{BlockNumber, BlockRun, BlockSize, GroupNumber, InodeId, ParseError, is_dir};
use std::time::{SystemTime, UNIX_EPOCH};

/// Allocation and addressing state shared by inode operations.
#[derive(Debug, Clone, Copy)]
pub struct InodeContext<'a> {
    pub allocator: &'a BlockAllocator,
    pub block_size: BlockSize,
    pub ag_shift: u32,
}

impl<'a> InodeContext<'a> {
    pub fn new(allocator: &'a BlockAllocator) -> Result<Self> {
        let geo = allocator.geometry();
        let block_size = BlockSize::new(geo.block_size)
            .map_err(|e| BfsError::InvalidGeometry(e.to_string()))?;
        Ok(Self {
            allocator,
            block_size,
            ag_shift: geo.ag_shift,
        })
    }

    fn block_of(&self, run: BlockRun) -> Result<BlockNumber> {
        run.to_block(self.ag_shift).ok_or_else(|| BfsError::Corruption {
            block: 0,
            detail: format!("block run {run} is not addressable"),
        })
    }
}

/// A loaded or freshly created inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    id: InodeId,
    run: BlockRun,
    ag_shift: u32,
    node: DiskInode,
}

impl Inode {
    /// Allocate and write a new inode, linking it into `parent` as `name`.
    ///
    /// Without a parent the inode is unlinked (the root directory, the
    /// indices directory) and `name` is ignored. Containers get one data
    /// block holding an empty entry stream.
    pub fn create(
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        parent: Option<&Inode>,
        name: &str,
        mode: u32,
    ) -> Result<Self> {
        Self::create_with(txn, ctx, parent, name, mode, |_| {})
    }

    pub(crate) fn create_with(
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        parent: Option<&Inode>,
        name: &str,
        mode: u32,
        configure: impl FnOnce(&mut DiskInode),
    ) -> Result<Self> {
        if let Some(parent) = parent {
            check_name(name)?;
            if parent.lookup(txn, name)?.is_some() {
                return Err(BfsError::Exists);
            }
        }

        let run = ctx
            .allocator
            .allocate_for_inode(txn, parent.map(Inode::block_run), mode)?;
        let block = ctx.block_of(run)?;
        let parent_run = parent.map_or(run, Inode::block_run);
        let mut node = DiskInode::new(run, parent_run, mode, ctx.block_size.get(), now());
        configure(&mut node);

        let inode = Self {
            id: InodeId::from(block),
            run,
            ag_shift: ctx.ag_shift,
            node: node.clone(),
        };
        if is_dir(mode) {
            // Writes the inode block as well.
            inode.write_entries(txn, ctx, node, &[])?;
        } else {
            inode.store(txn, ctx, &node)?;
        }
        if let Some(parent) = parent {
            parent.insert(txn, ctx, name, inode.id)?;
        }

        tracing::debug!(
            target: "bfs::inode",
            inode = inode.id.0,
            %run,
            mode,
            "inode_created"
        );
        Ok(inode)
    }

    /// Read the inode stored at block `id`.
    ///
    /// Only the block magic is checked here; [`Inode::init_check`] verifies
    /// that the block really holds a live inode.
    pub fn load(source: &dyn BlockRead, ag_shift: u32, id: InodeId) -> Result<Self> {
        let block = BlockNumber::from(id);
        let buf = source.read_block(block)?;
        let node = DiskInode::parse(buf.as_slice()).map_err(|e| corrupt(block, &e))?;
        Ok(Self {
            id,
            run: BlockRun::from_block(block, ag_shift),
            ag_shift,
            node,
        })
    }

    /// Read the inode a block run points at.
    pub fn load_run(source: &dyn BlockRead, ag_shift: u32, run: BlockRun) -> Result<Self> {
        let block = run.to_block(ag_shift).ok_or_else(|| BfsError::Corruption {
            block: 0,
            detail: format!("inode run {run} is not addressable"),
        })?;
        Self::load(source, ag_shift, InodeId::from(block))
    }

    pub fn init_check(&self) -> Result<()> {
        let block = BlockNumber::from(self.id);
        if !self.node.is_in_use() {
            return Err(BfsError::Corruption {
                block: block.0,
                detail: "inode is not in use".to_owned(),
            });
        }
        if self.node.inode_num != self.run {
            return Err(BfsError::Corruption {
                block: block.0,
                detail: format!(
                    "inode claims run {} but was found at {}",
                    self.node.inode_num, self.run
                ),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> InodeId {
        self.id
    }

    #[must_use]
    pub fn block_run(&self) -> BlockRun {
        self.run
    }

    #[must_use]
    pub fn mode(&self) -> u32 {
        self.node.mode
    }

    #[must_use]
    pub fn is_container(&self) -> bool {
        self.node.is_container()
    }

    #[must_use]
    pub fn is_index_directory(&self) -> bool {
        self.node.is_index_directory()
    }

    #[must_use]
    pub fn parent(&self) -> BlockRun {
        self.node.parent
    }

    /// The inode block as it was when this handle was loaded or created.
    #[must_use]
    pub fn node(&self) -> &DiskInode {
        &self.node
    }

    /// Current contents of the inode block.
    pub fn read_node(&self, source: &dyn BlockRead) -> Result<DiskInode> {
        let block = BlockNumber::from(self.id);
        let buf = source.read_block(block)?;
        DiskInode::parse(buf.as_slice()).map_err(|e| corrupt(block, &e))
    }

    pub(crate) fn store(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        node: &DiskInode,
    ) -> Result<()> {
        let bytes = node
            .to_block(ctx.block_size.as_usize())
            .map_err(|e| BfsError::Format(format!("inode {}: {e}", self.id)))?;
        txn.write_block(BlockNumber::from(self.id), &bytes)
    }

    // ── Directory entries ───────────────────────────────────────────────────

    pub fn entries(&self, source: &dyn BlockRead) -> Result<Vec<DirEntry>> {
        let node = self.read_node(source)?;
        self.read_entries(source, &node)
    }

    pub fn lookup(&self, source: &dyn BlockRead, name: &str) -> Result<Option<InodeId>> {
        Ok(self
            .entries(source)?
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.inode))
    }

    /// Link `id` into this directory as `name`.
    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        name: &str,
        id: InodeId,
    ) -> Result<()> {
        check_name(name)?;
        let node = self.read_node(txn)?;
        let mut entries = self.read_entries(txn, &node)?;
        if entries.iter().any(|entry| entry.name == name) {
            return Err(BfsError::Exists);
        }
        entries.push(DirEntry {
            name: name.to_owned(),
            inode: id,
        });
        self.write_entries(txn, ctx, node, &entries)
    }

    /// Unlink `name`, returning the inode it pointed at.
    pub fn remove(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        name: &str,
    ) -> Result<InodeId> {
        let node = self.read_node(txn)?;
        let mut entries = self.read_entries(txn, &node)?;
        let pos = entries
            .iter()
            .position(|entry| entry.name == name)
            .ok_or_else(|| BfsError::NotFound(name.to_owned()))?;
        let removed = entries.remove(pos);
        self.write_entries(txn, ctx, node, &entries)?;
        Ok(removed.inode)
    }

    /// Point this inode's parent at `parent` after a move.
    pub fn reparent(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        parent: &Inode,
    ) -> Result<()> {
        let mut node = self.read_node(txn)?;
        node.parent = parent.run;
        self.store(txn, ctx, &node)
    }

    fn read_entries(&self, source: &dyn BlockRead, node: &DiskInode) -> Result<Vec<DirEntry>> {
        if !node.is_container() {
            return Err(BfsError::NotDirectory);
        }
        let home = BlockNumber::from(self.id);
        let size = usize::try_from(node.data.size).map_err(|_| BfsError::Corruption {
            block: home.0,
            detail: format!("directory size {} overflows usize", node.data.size),
        })?;

        let mut stream = Vec::with_capacity(size);
        'runs: for run in node.data.runs() {
            let first = run.to_block(self.ag_shift).ok_or_else(|| BfsError::Corruption {
                block: home.0,
                detail: format!("directory run {run} is not addressable"),
            })?;
            for i in 0..u64::from(run.length) {
                if stream.len() >= size {
                    break 'runs;
                }
                stream.extend_from_slice(source.read_block(BlockNumber(first.0 + i))?.as_slice());
            }
        }
        if stream.len() < size {
            return Err(BfsError::Corruption {
                block: home.0,
                detail: format!("directory stream truncated: {} of {size} bytes", stream.len()),
            });
        }
        stream.truncate(size);
        parse_dir_stream(&stream).map_err(|e| corrupt(home, &e))
    }

    fn write_entries(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        mut node: DiskInode,
        entries: &[DirEntry],
    ) -> Result<()> {
        let stream = encode_dir_stream(entries)
            .map_err(|e| BfsError::Format(format!("directory {}: {e}", self.id)))?;
        let block_size = ctx.block_size.as_usize();
        while capacity(&node, block_size) < stream.len() {
            self.grow(txn, ctx, &mut node)?;
        }

        let mut chunks = stream.chunks(block_size);
        'runs: for run in node.data.runs() {
            let first = ctx.block_of(run)?;
            for i in 0..u64::from(run.length) {
                let Some(chunk) = chunks.next() else {
                    break 'runs;
                };
                let mut block = vec![0_u8; block_size];
                block[..chunk.len()].copy_from_slice(chunk);
                txn.write_block(BlockNumber(first.0 + i), &block)?;
            }
        }

        node.data.size = stream.len() as u64;
        node.last_modified_time = now();
        self.store(txn, ctx, &node)
    }

    /// Add one data block to a directory.
    fn grow(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        node: &mut DiskInode,
    ) -> Result<()> {
        let slot = node
            .data
            .direct
            .iter()
            .position(|run| run.is_zero())
            .ok_or(BfsError::NoSpace)?;
        let run = ctx.allocator.allocate_blocks(txn, group_of(self.run), 1)?;
        node.data.direct[slot] = run;
        node.data.max_direct_range += u64::from(ctx.block_size.get());
        tracing::trace!(target: "bfs::inode", inode = self.id.0, %run, "directory_grown");
        Ok(())
    }
}

fn capacity(node: &DiskInode, block_size: usize) -> usize {
    node.data
        .runs()
        .map(|run| usize::from(run.length) * block_size)
        .sum()
}

fn group_of(run: BlockRun) -> GroupNumber {
    GroupNumber(u32::try_from(run.allocation_group).unwrap_or(0))
}

fn check_name(name: &str) -> Result<()> {
    validate_name(name).map_err(|e| BfsError::InvalidName(format!("{name:?}: {e}")))
}

pub(crate) fn corrupt(block: BlockNumber, err: &ParseError) -> BfsError {
    BfsError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

/// Current time in the on-disk timestamp encoding.
pub(crate) fn now() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX >> 16);
    encode_time(secs, elapsed.subsec_nanos())
}

#[cfg(test)]
pub(crate) mod fixture {
    use bfs_alloc::BlockAllocator;
    use bfs_block::{BlockCache, ByteDevice, MemoryByteDevice};
    use bfs_error::Result;
    use bfs_journal::{AnchorUpdate, Journal, LogAnchor, LogExtent, LogPointers};
    use bfs_ondisk::SuperBlock;
    use bfs_types::{BlockNumber, BlockSize};
    use std::sync::Arc;

    use crate::InodeContext;

    struct NullAnchor;

    impl LogAnchor for NullAnchor {
        fn anchor(&self, _update: &AnchorUpdate) -> Result<()> {
            Ok(())
        }
    }

    /// 1K blocks, two allocation groups, bitmap at 1..3, log at 3..131.
    pub(crate) struct Fixture {
        pub journal: Journal,
        pub allocator: BlockAllocator,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let num_blocks = 12_000;
            let block_size = BlockSize::new(1024).expect("block size");
            let sb = SuperBlock::initialize("inodes", num_blocks, block_size);
            assert_eq!(sb.num_ags, 2);
            let mem: Arc<dyn ByteDevice> = Arc::new(MemoryByteDevice::new(12_000 * 1024));
            let cache = BlockCache::init(mem, num_blocks, block_size, 512).expect("cache");
            let journal = Journal::new(
                Arc::new(cache),
                LogExtent {
                    first_block: BlockNumber(3),
                    length: 128,
                },
                LogPointers::default(),
                Arc::new(NullAnchor),
            );
            let allocator = BlockAllocator::new(&sb).expect("allocator");
            let mut txn = journal.begin().expect("begin");
            allocator
                .initialize_and_clear_bitmap(&mut txn, BlockNumber(131))
                .expect("clear bitmap");
            txn.done().expect("commit");
            Self { journal, allocator }
        }

        pub(crate) fn ctx(&self) -> InodeContext<'_> {
            InodeContext::new(&self.allocator).expect("context")
        }

        pub(crate) fn cache(&self) -> &BlockCache {
            self.journal.cache()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::Fixture;
    use super::*;
    use bfs_types::{S_IFDIR, S_IFREG};

    fn root(fx: &Fixture) -> Inode {
        let ctx = fx.ctx();
        let mut txn = fx.journal.begin().expect("begin");
        let root = Inode::create(&mut txn, &ctx, None, "", S_IFDIR | 0o755).expect("root");
        txn.done().expect("commit");
        root
    }

    #[test]
    fn root_directory_starts_empty() {
        let fx = Fixture::new();
        let root = root(&fx);
        assert_eq!(root.block_run(), BlockRun::new(0, 131, 1));
        assert_eq!(root.id(), InodeId(131));
        assert_eq!(root.parent(), root.block_run());
        assert!(root.is_container());

        let loaded = Inode::load(fx.cache(), 13, root.id()).expect("load");
        loaded.init_check().expect("init check");
        assert_eq!(loaded.mode(), S_IFDIR | 0o755);
        assert!(loaded.entries(fx.cache()).expect("entries").is_empty());
    }

    #[test]
    fn children_are_linked_and_placed_by_type() {
        let fx = Fixture::new();
        let root = root(&fx);
        let ctx = fx.ctx();
        let mut txn = fx.journal.begin().expect("begin");
        let dir = Inode::create(&mut txn, &ctx, Some(&root), "docs", S_IFDIR | 0o755)
            .expect("dir");
        let file = Inode::create(&mut txn, &ctx, Some(&dir), "readme", S_IFREG | 0o644)
            .expect("file");
        assert_eq!(root.lookup(&txn, "docs").expect("lookup"), Some(dir.id()));
        txn.done().expect("commit");

        assert_eq!(dir.block_run().allocation_group, 1);
        assert_eq!(file.block_run().allocation_group, 1);
        assert_eq!(file.parent(), dir.block_run());
        assert_eq!(dir.lookup(fx.cache(), "readme").expect("lookup"), Some(file.id()));
        assert_eq!(root.lookup(fx.cache(), "missing").expect("lookup"), None);
        assert!(matches!(
            file.lookup(fx.cache(), "x"),
            Err(BfsError::NotDirectory)
        ));
    }

    #[test]
    fn duplicate_and_invalid_names_are_refused() {
        let fx = Fixture::new();
        let root = root(&fx);
        let ctx = fx.ctx();
        let mut txn = fx.journal.begin().expect("begin");
        Inode::create(&mut txn, &ctx, Some(&root), "a", S_IFREG).expect("create");
        assert!(matches!(
            Inode::create(&mut txn, &ctx, Some(&root), "a", S_IFREG),
            Err(BfsError::Exists)
        ));
        assert!(matches!(
            Inode::create(&mut txn, &ctx, Some(&root), "a/b", S_IFREG),
            Err(BfsError::InvalidName(_))
        ));
        assert!(matches!(
            root.insert(&mut txn, &ctx, "a", InodeId(999)),
            Err(BfsError::Exists)
        ));
    }

    #[test]
    fn remove_unlinks_entry() {
        let fx = Fixture::new();
        let root = root(&fx);
        let ctx = fx.ctx();
        let mut txn = fx.journal.begin().expect("begin");
        let file = Inode::create(&mut txn, &ctx, Some(&root), "gone", S_IFREG).expect("create");
        assert_eq!(root.remove(&mut txn, &ctx, "gone").expect("remove"), file.id());
        assert!(matches!(
            root.remove(&mut txn, &ctx, "gone"),
            Err(BfsError::NotFound(_))
        ));
        txn.done().expect("commit");
        assert!(root.entries(fx.cache()).expect("entries").is_empty());
    }

    #[test]
    fn reparent_records_new_parent() {
        let fx = Fixture::new();
        let root = root(&fx);
        let ctx = fx.ctx();
        let mut txn = fx.journal.begin().expect("begin");
        let dir = Inode::create(&mut txn, &ctx, Some(&root), "d", S_IFDIR | 0o755).expect("dir");
        let file = Inode::create(&mut txn, &ctx, Some(&root), "f", S_IFREG).expect("file");
        assert_eq!(file.read_node(&txn).expect("node").parent, root.block_run());
        file.reparent(&mut txn, &ctx, &dir).expect("reparent");
        txn.done().expect("commit");
        assert_eq!(file.read_node(fx.cache()).expect("node").parent, dir.block_run());
    }

    #[test]
    fn directory_grows_across_blocks() {
        let fx = Fixture::new();
        let root = root(&fx);
        let ctx = fx.ctx();
        let mut txn = fx.journal.begin().expect("begin");
        for i in 0..60 {
            let name = format!("entry-with-a-long-name-{i:04}");
            root.insert(&mut txn, &ctx, &name, InodeId(5000 + i)).expect("insert");
        }
        txn.done().expect("commit");

        let node = root.read_node(fx.cache()).expect("node");
        assert!(node.data.runs().count() >= 3, "{:?}", node.data);
        let entries = root.entries(fx.cache()).expect("entries");
        assert_eq!(entries.len(), 60);
        assert_eq!(entries[0].name, "entry-with-a-long-name-0000");
        assert_eq!(
            root.lookup(fx.cache(), "entry-with-a-long-name-0059").expect("lookup"),
            Some(InodeId(5059))
        );
    }

    #[test]
    fn aborted_creation_leaves_nothing_behind() {
        let fx = Fixture::new();
        let root = root(&fx);
        let ctx = fx.ctx();
        {
            let mut txn = fx.journal.begin().expect("begin");
            Inode::create(&mut txn, &ctx, Some(&root), "ghost", S_IFREG).expect("create");
        }
        assert_eq!(root.lookup(fx.cache(), "ghost").expect("lookup"), None);
        let next = {
            let mut txn = fx.journal.begin().expect("begin");
            Inode::create(&mut txn, &ctx, Some(&root), "real", S_IFREG).expect("create")
        };
        assert_eq!(next.block_run().allocation_group, 0);
    }

    #[test]
    fn init_check_rejects_misplaced_and_unused_inodes() {
        let fx = Fixture::new();
        let root = root(&fx);

        let copy = fx.cache().read_block(BlockNumber(131)).expect("read");
        fx.cache().write_block(BlockNumber(900), copy.as_slice()).expect("write");
        let misplaced = Inode::load(fx.cache(), 13, InodeId(900)).expect("load");
        assert!(misplaced.init_check().is_err());

        let mut node = root.read_node(fx.cache()).expect("node");
        node.flags = 0;
        fx.cache()
            .write_block(BlockNumber(131), &node.to_block(1024).expect("serialize"))
            .expect("write");
        let unused = Inode::load(fx.cache(), 13, root.id()).expect("load");
        assert!(unused.init_check().is_err());

        assert!(matches!(
            Inode::load(fx.cache(), 13, InodeId(5000)),
            Err(BfsError::Corruption { block: 5000, .. })
        ));
    }
}
