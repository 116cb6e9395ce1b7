//! Creating a fresh volume.

use crate::options::InitializeOptions;
use crate::superblock_store::SuperBlockStore;
use crate::volume::{Volume, block_run_in_bounds};
use bfs_alloc::BlockAllocator;
use bfs_block::{BlockCache, ByteDevice};
use bfs_error::{BfsError, Result};
use bfs_inode::{Attribute, CreateMode, Index, Inode, InodeContext};
use bfs_journal::{Journal, LogAnchor, LogExtent, Transaction};
use bfs_ondisk::SuperBlock;
use bfs_types::{
    BlockNumber, BlockRun, BlockSize, ByteOffset, MIN_BLOCK_COUNT, S_IFDIR, S_INDEX_DIR,
    S_STR_INDEX, TypeCode,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Arc;

/// Attribute holding the random volume id on the root directory.
pub const VOLUME_ID_ATTRIBUTE: &str = "be:volume_id";

/// Indices every new volume starts with.
pub const STANDARD_INDICES: [(&str, TypeCode); 4] = [
    ("name", TypeCode::STRING),
    ("BEOS:APP_SIG", TypeCode::STRING),
    ("last_modified", TypeCode::INT64),
    ("size", TypeCode::INT64),
];

const SMALL_VOLUME_BLOCKS: u64 = 20_480;
const LARGE_DEVICE_BYTES: u64 = 1 << 30;
const BOOT_BLOCK_SIZE: usize = 512;
pub(crate) const LEGACY_BOOT_OFFSET: u64 = 1024;

/// Log length in blocks for a new volume.
#[must_use]
pub fn log_blocks_for(num_blocks: u64, device_bytes: u64) -> u16 {
    if num_blocks <= SMALL_VOLUME_BLOCKS {
        512
    } else if device_bytes > LARGE_DEVICE_BYTES {
        4096
    } else {
        2048
    }
}

impl Volume {
    /// Write a new, empty volume named `name` over the whole of `device`.
    ///
    /// Everything after the superblock is built in one transaction, which is
    /// committed, checkpointed and dropped from the cache before returning.
    pub fn initialize(
        device: Arc<dyn ByteDevice>,
        name: &str,
        options: &InitializeOptions,
    ) -> Result<SuperBlock> {
        if name.contains('/') {
            return Err(BfsError::InvalidName(format!("volume name {name:?}")));
        }
        let block_size = BlockSize::new(options.block_size)
            .map_err(|_| BfsError::UnsupportedBlockSize(options.block_size))?;
        if device.is_read_only() {
            return Err(BfsError::ReadOnlyDevice);
        }
        let device_bytes = device.len_bytes();
        let num_blocks = device_bytes / u64::from(block_size.get());
        if num_blocks < MIN_BLOCK_COUNT {
            return Err(BfsError::DeviceTooSmall {
                device_bytes,
                fs_bytes: MIN_BLOCK_COUNT * u64::from(block_size.get()),
            });
        }

        let mut sb = SuperBlock::initialize(name, num_blocks, block_size);
        let log_length = log_blocks_for(num_blocks, device_bytes);
        let log_first = BlockNumber(sb.bitmap_blocks() + 1);
        let log_start = BlockRun::from_block(log_first, sb.ag_shift);
        sb.log_blocks = BlockRun::new(log_start.allocation_group, log_start.start, log_length);
        sb.log_start = log_first.0;
        sb.log_end = log_first.0;
        sb.validate()
            .map_err(|e| BfsError::InvalidGeometry(e.to_string()))?;
        if !block_run_in_bounds(sb.log_blocks, sb.num_ags, sb.ag_shift) {
            return Err(BfsError::InvalidGeometry(format!(
                "log run {} does not fit its allocation group",
                sb.log_blocks
            )));
        }
        let reserved_end = sb
            .reserved_end()
            .filter(|end| end.0 < num_blocks)
            .ok_or(BfsError::DeviceTooSmall {
                device_bytes,
                fs_bytes: (log_first.0 + u64::from(log_length) + 1)
                    * u64::from(block_size.get()),
            })?;

        let store = Arc::new(SuperBlockStore::new(Arc::clone(&device), sb));
        let cache = Arc::new(BlockCache::init(
            Arc::clone(&device),
            num_blocks,
            block_size,
            options.cache_blocks,
        )?);
        let anchor: Arc<dyn LogAnchor> = store.clone();
        let journal = Journal::new(
            Arc::clone(&cache),
            LogExtent {
                first_block: log_first,
                length: u64::from(log_length),
            },
            store.log_pointers(),
            anchor,
        );
        let unwind = |err: BfsError| {
            journal.set_read_only(true);
            err
        };
        journal.init_check().map_err(unwind)?;
        let allocator = BlockAllocator::new(&store.snapshot()).map_err(unwind)?;
        let ctx = InodeContext::new(&allocator).map_err(unwind)?;
        let mut rng: Box<dyn RngCore> = match options.volume_id_seed {
            Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
            None => Box::new(rand::thread_rng()),
        };

        let mut txn = journal.begin().map_err(unwind)?;
        build(
            &mut txn,
            &ctx,
            &store,
            device.as_ref(),
            reserved_end,
            options,
            rng.as_mut(),
        )
        .map_err(unwind)?;
        txn.done().map_err(unwind)?;

        journal.flush_log_and_blocks().map_err(unwind)?;
        journal.set_read_only(true);
        cache.discard();

        let sb = store.snapshot();
        tracing::info!(
            target: "bfs::volume",
            name = %sb.name,
            block_size = sb.block_size,
            num_blocks = sb.num_blocks,
            num_ags = sb.num_ags,
            log_blocks = log_length,
            indices = !options.no_indices,
            "volume_initialized"
        );
        Ok(sb)
    }
}

/// Everything a new volume holds, staged in one transaction.
fn build(
    txn: &mut Transaction<'_>,
    ctx: &InodeContext<'_>,
    store: &SuperBlockStore,
    device: &dyn ByteDevice,
    reserved_end: BlockNumber,
    options: &InitializeOptions,
    rng: &mut dyn RngCore,
) -> Result<()> {
    ctx.allocator.initialize_and_clear_bitmap(txn, reserved_end)?;

    let root = Inode::create(txn, ctx, None, "", S_IFDIR | 0o755)?;
    store.update(|sb| sb.root_dir = root.block_run());

    if !options.no_indices {
        let indices = create_indices_root(txn, ctx)?;
        store.update(|sb| sb.indices = indices.block_run());
        for (name, type_code) in STANDARD_INDICES {
            Index::create(txn, ctx, &indices, name, type_code)?;
        }
    }

    create_volume_id(txn, ctx, &root, rng)?;
    erase_unused_boot_block(device, false)?;
    store.write()
}

/// Create the unlinked indices directory inode.
pub(crate) fn create_indices_root(
    txn: &mut Transaction<'_>,
    ctx: &InodeContext<'_>,
) -> Result<Inode> {
    Inode::create(txn, ctx, None, "", S_INDEX_DIR | S_STR_INDEX | S_IFDIR | 0o700)
}

/// Store a random 64-bit volume id on `root`.
pub(crate) fn create_volume_id(
    txn: &mut Transaction<'_>,
    ctx: &InodeContext<'_>,
    root: &Inode,
    rng: &mut dyn RngCore,
) -> Result<u64> {
    let id = rng.next_u64();
    let attribute = Attribute::new(root);
    let mut cookie = attribute.create(
        txn,
        ctx,
        VOLUME_ID_ATTRIBUTE,
        TypeCode::UINT64,
        CreateMode::Truncate,
    )?;
    attribute.write(txn, ctx, &mut cookie, 0, &id.to_le_bytes())?;
    tracing::debug!(target: "bfs::volume", volume_id = id, "volume_id_created");
    Ok(id)
}

/// Zero the foreign boot sectors at byte 0 and, unless `keep_legacy`, at
/// byte 1024.
///
/// Formatting erases both: with 1024-byte blocks byte 1024 is the first
/// bitmap block, which the format transaction rewrites when it is flushed.
pub(crate) fn erase_unused_boot_block(device: &dyn ByteDevice, keep_legacy: bool) -> Result<()> {
    let zeros = [0_u8; BOOT_BLOCK_SIZE];
    device.write_all_at(ByteOffset::ZERO, &zeros)?;
    if !keep_legacy {
        device.write_all_at(ByteOffset(LEGACY_BOOT_OFFSET), &zeros)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::MountOptions;
    use bfs_block::MemoryByteDevice;

    fn options(block_size: u32) -> InitializeOptions {
        InitializeOptions {
            block_size,
            volume_id_seed: Some(42),
            ..InitializeOptions::default()
        }
    }

    #[test]
    fn log_size_tiers() {
        assert_eq!(log_blocks_for(20_480, 20_480 * 1024), 512);
        assert_eq!(log_blocks_for(20_481, 20_481 * 1024), 2048);
        assert_eq!(log_blocks_for(300_000, 300_000 * 4096), 4096);
        assert_eq!(log_blocks_for(262_144, 1 << 30), 2048);
    }

    #[test]
    fn rejects_bad_requests() {
        let mem = Arc::new(MemoryByteDevice::new(64 * 1024));
        assert!(matches!(
            Volume::initialize(mem.clone(), "a/b", &options(1024)),
            Err(BfsError::InvalidName(_))
        ));
        assert!(matches!(
            Volume::initialize(mem.clone(), "v", &options(3000)),
            Err(BfsError::UnsupportedBlockSize(3000))
        ));
        assert!(matches!(
            Volume::initialize(mem.clone(), "v", &options(8192)),
            Err(BfsError::DeviceTooSmall { .. })
        ));
        // Ten blocks pass the minimum but cannot hold a 512-block log.
        assert!(matches!(
            Volume::initialize(mem.clone(), "v", &options(4096)),
            Err(BfsError::DeviceTooSmall { .. })
        ));
        assert_eq!(mem.write_count(), 0);

        let read_only = Arc::new(MemoryByteDevice::new_read_only(vec![0; 1 << 20]));
        assert!(matches!(
            Volume::initialize(read_only, "v", &options(1024)),
            Err(BfsError::ReadOnlyDevice)
        ));
    }

    #[test]
    fn fresh_volume_layout() {
        let mem = Arc::new(MemoryByteDevice::from_bytes(vec![0xAA; 12_000 * 1024]));
        let sb = Volume::initialize(mem.clone(), "fresh", &options(1024)).expect("initialize");
        assert_eq!(sb.name, "fresh");
        assert_eq!(sb.log_blocks, BlockRun::new(0, 3, 512));
        assert_eq!(sb.log_start, sb.log_end);
        assert!(sb.is_clean());
        assert!(sb.has_indices());
        assert_eq!(sb.root_dir, BlockRun::new(0, 515, 1));

        let image = mem.snapshot();
        assert!(image[..512].iter().all(|b| *b == 0), "boot block erased");

        let volume = Volume::mount_device(mem.clone(), &MountOptions::default()).expect("mount");
        assert_eq!(volume.mount_report().corrected_used_blocks, None);
        assert_eq!(volume.superblock().used_blocks, sb.used_blocks);
        let id = volume
            .read_attribute(volume.root().id(), VOLUME_ID_ATTRIBUTE)
            .expect("read")
            .expect("volume id");
        assert_eq!(id.type_code, TypeCode::UINT64);
        assert_eq!(id.value, StdRng::seed_from_u64(42).next_u64().to_le_bytes());
    }

    #[test]
    fn no_indices_skips_the_indices_directory() {
        let mem = Arc::new(MemoryByteDevice::new(12_000 * 1024));
        let init = InitializeOptions {
            no_indices: true,
            ..options(2048)
        };
        let sb = Volume::initialize(mem.clone(), "bare", &init).expect("initialize");
        assert!(!sb.has_indices());
        let volume = Volume::mount_device(mem, &MountOptions::default()).expect("mount");
        assert!(!volume.has_indices());
        assert!(volume.index_names().expect("names").is_empty());
    }

    #[test]
    fn legacy_boot_sector_is_optional() {
        let both = MemoryByteDevice::from_bytes(vec![1; 4096]);
        erase_unused_boot_block(&both, false).expect("erase");
        let image = both.snapshot();
        assert!(image[..512].iter().all(|b| *b == 0));
        assert!(image[512..1024].iter().all(|b| *b == 1));
        assert!(image[1024..1536].iter().all(|b| *b == 0));

        let first_only = MemoryByteDevice::from_bytes(vec![1; 4096]);
        erase_unused_boot_block(&first_only, true).expect("erase");
        let image = first_only.snapshot();
        assert!(image[..512].iter().all(|b| *b == 0));
        assert!(image[1024..1536].iter().all(|b| *b == 1));
    }
}
