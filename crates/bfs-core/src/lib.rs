#![forbid(unsafe_code)]
//! The BFS volume layer.
//!
//! A [`Volume`] ties the on-disk pieces together: it locates and validates
//! the superblock, replays the journal, brings up the block allocator, loads
//! the root and indices directories and publishes the root to a
//! [`NodePublisher`]. Metadata changes go through a [`VolumeTransaction`],
//! which delivers live-query notifications once its journal entry commits.
//!
//! [`Volume::initialize`] formats a fresh volume onto a device.

mod check;
mod format;
mod node;
mod options;
mod superblock_store;
mod volume;

pub use check::{CheckReport, CheckVerdict, CheckVisitor};
pub use format::{STANDARD_INDICES, VOLUME_ID_ATTRIBUTE, log_blocks_for};
pub use node::{NodePublisher, NodeTable};
pub use options::{
    DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BLOCKS, DegradedReason, InitializeOptions, MountOptions,
    MountReport,
};
pub use superblock_store::SuperBlockStore;
pub use volume::{Volume, VolumeTransaction, block_run_in_bounds};

pub use bfs_block::{ByteDevice, FileByteDevice, MemoryByteDevice};
pub use bfs_error::{BfsError, Result};
pub use bfs_inode::{AttributeUpdate, Index, Inode};
pub use bfs_journal::{LogExtent, LogPointers, ReplayReport, Transaction};
pub use bfs_ondisk::{DirEntry, SmallData, SuperBlock, SuperBlockLocation};
pub use bfs_query::{
    AttributeChange, LiveQuery, LiveQueryHandle, PredicateQuery, QueryEvent, RenameMove,
};
pub use bfs_types::{BlockNumber, BlockRun, BlockSize, ByteOffset, InodeId, TxnId, TypeCode};
