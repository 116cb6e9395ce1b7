//! Mount and initialize options, and what a mount reports back.

use bfs_journal::ReplayReport;
use serde::{Deserialize, Serialize};

/// Default block cache capacity, in blocks.
pub const DEFAULT_CACHE_BLOCKS: usize = 4096;
/// Block size used by [`InitializeOptions::default`].
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub read_only: bool,
    pub cache_blocks: usize,
    /// The volume is being mounted as the boot volume.
    pub booting: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            booting: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializeOptions {
    pub block_size: u32,
    /// Skip the indices directory and the standard indices.
    pub no_indices: bool,
    pub cache_blocks: usize,
    /// Seed for the volume id; `None` draws from the thread-local RNG.
    pub volume_id_seed: Option<u64>,
}

impl Default for InitializeOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            no_indices: false,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            volume_id_seed: None,
        }
    }
}

/// Why a mounted volume is running with reduced capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DegradedReason {
    /// The device could only be opened read-only.
    DeviceReadOnly,
    /// The host byte order cannot write this volume.
    ForeignByteOrder,
    JournalReplayFailed { detail: String },
    IndicesUnavailable { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountReport {
    /// Byte offset the superblock was found at (512, or 0 for the
    /// alternate layout).
    pub superblock_offset: usize,
    pub read_only: bool,
    pub degraded: Vec<DegradedReason>,
    pub replay: Option<ReplayReport>,
    /// Used-block count recounted from the bitmap when the superblock
    /// disagreed.
    pub corrected_used_blocks: Option<u64>,
}

impl MountReport {
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}
