//! The volume superblock.
//!
//! Layout of the 512-byte record (all fields little-endian):
//!
//! | offset | field | type |
//! |--------|-------|------|
//! | 0x00 | name | `[u8; 32]` |
//! | 0x20 | magic1 | u32 |
//! | 0x24 | fs_byte_order | u32 |
//! | 0x28 | block_size | u32 |
//! | 0x2C | block_shift | u32 |
//! | 0x30 | num_blocks | u64 |
//! | 0x38 | used_blocks | u64 |
//! | 0x40 | inode_size | u32 |
//! | 0x44 | magic2 | u32 |
//! | 0x48 | blocks_per_ag | u32 |
//! | 0x4C | ag_shift | u32 |
//! | 0x50 | num_ags | u32 |
//! | 0x54 | flags | u32 |
//! | 0x58 | log_blocks | block run |
//! | 0x60 | log_start | u64 |
//! | 0x68 | log_end | u64 |
//! | 0x70 | magic3 | u32 |
//! | 0x74 | root_dir | block run |
//! | 0x7C | indices | block run |
//! | 0x84 | reserved | zero |

use bfs_types::{
    BlockNumber, BlockRun, BlockSize, DESIRED_ALLOCATION_GROUPS, MAX_AG_SHIFT, MIN_AG_SHIFT,
    MIN_BLOCK_COUNT, ParseError, SUPER_BLOCK_DISK_CLEAN, SUPER_BLOCK_DISK_DIRTY,
    SUPER_BLOCK_FS_LENDIAN, SUPER_BLOCK_MAGIC1, SUPER_BLOCK_MAGIC2, SUPER_BLOCK_MAGIC3,
    SUPER_BLOCK_OFFSET, SUPER_BLOCK_PROBE_SIZE, SUPER_BLOCK_SIZE, SUPPORTED_BLOCK_SIZES,
    VOLUME_NAME_LENGTH, ensure_slice, read_fixed, read_le_u32, read_le_u64, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Where a probe found the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuperBlockLocation {
    /// Byte offset 512, the standard layout.
    Primary,
    /// Byte offset 0, the alternate boot-sector layout.
    Alternate,
}

impl SuperBlockLocation {
    #[must_use]
    pub fn byte_offset(self) -> usize {
        match self {
            Self::Primary => SUPER_BLOCK_OFFSET,
            Self::Alternate => 0,
        }
    }
}

/// Host-native superblock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    pub name: String,
    pub magic1: u32,
    pub fs_byte_order: u32,
    pub block_size: u32,
    pub block_shift: u32,
    pub num_blocks: u64,
    pub used_blocks: u64,
    pub inode_size: u32,
    pub magic2: u32,
    /// Bitmap blocks per allocation group.
    pub blocks_per_ag: u32,
    pub ag_shift: u32,
    pub num_ags: u32,
    pub flags: u32,
    pub log_blocks: BlockRun,
    pub log_start: u64,
    pub log_end: u64,
    pub magic3: u32,
    pub root_dir: BlockRun,
    pub indices: BlockRun,
}

impl SuperBlock {
    /// Parse a 512-byte superblock record without validating it.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(region, 0, SUPER_BLOCK_SIZE)?;
        let name: [u8; VOLUME_NAME_LENGTH] = read_fixed(region, 0x00)?;
        Ok(Self {
            name: trim_nul_padded(&name),
            magic1: read_le_u32(region, 0x20)?,
            fs_byte_order: read_le_u32(region, 0x24)?,
            block_size: read_le_u32(region, 0x28)?,
            block_shift: read_le_u32(region, 0x2C)?,
            num_blocks: read_le_u64(region, 0x30)?,
            used_blocks: read_le_u64(region, 0x38)?,
            inode_size: read_le_u32(region, 0x40)?,
            magic2: read_le_u32(region, 0x44)?,
            blocks_per_ag: read_le_u32(region, 0x48)?,
            ag_shift: read_le_u32(region, 0x4C)?,
            num_ags: read_le_u32(region, 0x50)?,
            flags: read_le_u32(region, 0x54)?,
            log_blocks: BlockRun::parse(region, 0x58)?,
            log_start: read_le_u64(region, 0x60)?,
            log_end: read_le_u64(region, 0x68)?,
            magic3: read_le_u32(region, 0x70)?,
            root_dir: BlockRun::parse(region, 0x74)?,
            indices: BlockRun::parse(region, 0x7C)?,
        })
    }

    /// Serialize into the canonical 512-byte record.
    pub fn to_bytes(&self) -> Result<[u8; SUPER_BLOCK_SIZE], ParseError> {
        fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        }

        let mut buf = [0_u8; SUPER_BLOCK_SIZE];
        let name = truncated_name(&self.name);
        put(&mut buf, 0x00, name.as_bytes());
        put(&mut buf, 0x20, &self.magic1.to_le_bytes());
        put(&mut buf, 0x24, &self.fs_byte_order.to_le_bytes());
        put(&mut buf, 0x28, &self.block_size.to_le_bytes());
        put(&mut buf, 0x2C, &self.block_shift.to_le_bytes());
        put(&mut buf, 0x30, &self.num_blocks.to_le_bytes());
        put(&mut buf, 0x38, &self.used_blocks.to_le_bytes());
        put(&mut buf, 0x40, &self.inode_size.to_le_bytes());
        put(&mut buf, 0x44, &self.magic2.to_le_bytes());
        put(&mut buf, 0x48, &self.blocks_per_ag.to_le_bytes());
        put(&mut buf, 0x4C, &self.ag_shift.to_le_bytes());
        put(&mut buf, 0x50, &self.num_ags.to_le_bytes());
        put(&mut buf, 0x54, &self.flags.to_le_bytes());
        self.log_blocks.write_to(&mut buf, 0x58)?;
        put(&mut buf, 0x60, &self.log_start.to_le_bytes());
        put(&mut buf, 0x68, &self.log_end.to_le_bytes());
        put(&mut buf, 0x70, &self.magic3.to_le_bytes());
        self.root_dir.write_to(&mut buf, 0x74)?;
        self.indices.write_to(&mut buf, 0x7C)?;
        Ok(buf)
    }

    /// Fill a superblock for a fresh volume.
    ///
    /// `name` is truncated to 31 bytes; rejecting path separators is the
    /// caller's job. Allocation groups start at the smallest shift the block
    /// size allows and grow until at most [`DESIRED_ALLOCATION_GROUPS`] remain
    /// or the shift reaches [`MAX_AG_SHIFT`].
    #[must_use]
    pub fn initialize(name: &str, num_blocks: u64, block_size: BlockSize) -> Self {
        let bits_per_block = block_size.bits_per_block();
        let bitmap_blocks = num_blocks.div_ceil(bits_per_block);

        let mut group_shift = MIN_AG_SHIFT;
        let mut scale = 8192_u64;
        while scale < bits_per_block {
            group_shift += 1;
            scale *= 2;
        }

        let mut bitmap_blocks_per_group = 1_u64;
        let num_groups = loop {
            let groups = bitmap_blocks.div_ceil(bitmap_blocks_per_group);
            if groups > DESIRED_ALLOCATION_GROUPS && group_shift < MAX_AG_SHIFT {
                group_shift += 1;
                bitmap_blocks_per_group *= 2;
            } else {
                break groups;
            }
        };

        Self {
            name: truncated_name(name).to_owned(),
            magic1: SUPER_BLOCK_MAGIC1,
            fs_byte_order: SUPER_BLOCK_FS_LENDIAN,
            block_size: block_size.get(),
            block_shift: block_size.shift(),
            num_blocks,
            used_blocks: 0,
            inode_size: block_size.get(),
            magic2: SUPER_BLOCK_MAGIC2,
            blocks_per_ag: u32::try_from(bitmap_blocks_per_group).unwrap_or(u32::MAX),
            ag_shift: group_shift,
            num_ags: u32::try_from(num_groups).unwrap_or(u32::MAX),
            flags: SUPER_BLOCK_DISK_CLEAN,
            log_blocks: BlockRun::ZERO,
            log_start: 0,
            log_end: 0,
            magic3: SUPER_BLOCK_MAGIC3,
            root_dir: BlockRun::ZERO,
            indices: BlockRun::ZERO,
        }
    }

    #[must_use]
    pub fn is_magic_valid(&self) -> bool {
        self.magic1 == SUPER_BLOCK_MAGIC1
            && self.magic2 == SUPER_BLOCK_MAGIC2
            && self.magic3 == SUPER_BLOCK_MAGIC3
    }

    /// Check every structural invariant, reporting the first violation.
    pub fn validate(&self) -> Result<(), ParseError> {
        for (expected, actual) in [
            (SUPER_BLOCK_MAGIC1, self.magic1),
            (SUPER_BLOCK_MAGIC2, self.magic2),
            (SUPER_BLOCK_MAGIC3, self.magic3),
        ] {
            if expected != actual {
                return Err(ParseError::InvalidMagic {
                    expected: u64::from(expected),
                    actual: u64::from(actual),
                });
            }
        }
        if self.block_size != self.inode_size {
            return Err(invalid("inode_size", "must equal block_size"));
        }
        if self.fs_byte_order != SUPER_BLOCK_FS_LENDIAN {
            return Err(invalid("fs_byte_order", "not the little-endian tag"));
        }
        if 1_u32.checked_shl(self.block_shift) != Some(self.block_size) {
            return Err(invalid("block_shift", "inconsistent with block_size"));
        }
        if !SUPPORTED_BLOCK_SIZES.contains(&self.block_size) {
            return Err(invalid("block_size", "must be one of 1024, 2048, 4096, 8192"));
        }
        if self.num_ags < 1 {
            return Err(invalid("num_ags", "must be at least 1"));
        }
        if self.ag_shift < 1 || self.ag_shift > MAX_AG_SHIFT {
            return Err(invalid("ag_shift", "must be in 1..=16"));
        }
        if self.blocks_per_ag < 1 {
            return Err(invalid("blocks_per_ag", "must be at least 1"));
        }
        if self.num_blocks < MIN_BLOCK_COUNT {
            return Err(invalid("num_blocks", "must be at least 10"));
        }
        let expected_groups = self.num_blocks.div_ceil(1_u64 << self.ag_shift);
        if u64::from(self.num_ags) != expected_groups {
            return Err(invalid("num_ags", "does not match num_blocks and ag_shift"));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Locate and parse the superblock inside the first 1024 bytes of a device.
    ///
    /// The primary location (512) wins when it validates. A primary record
    /// with good magic but bad geometry does not stop the probe; the alternate
    /// location (0) is tried next, and the primary's error is reported if
    /// neither validates.
    pub fn probe(region: &[u8]) -> Result<(Self, SuperBlockLocation), ParseError> {
        let region = ensure_slice(region, 0, SUPER_BLOCK_PROBE_SIZE)?;
        let primary = Self::parse_region(&region[SUPER_BLOCK_OFFSET..])?;
        let mut primary_error = None;
        if primary.is_magic_valid() {
            match primary.validate() {
                Ok(()) => return Ok((primary, SuperBlockLocation::Primary)),
                Err(err) => primary_error = Some(err),
            }
        }

        let alternate = Self::parse_region(&region[..SUPER_BLOCK_SIZE])?;
        if alternate.is_valid() {
            return Ok((alternate, SuperBlockLocation::Alternate));
        }

        Err(primary_error.unwrap_or(ParseError::InvalidMagic {
            expected: u64::from(SUPER_BLOCK_MAGIC1),
            actual: u64::from(primary.magic1),
        }))
    }

    // ── Derived geometry ────────────────────────────────────────────────

    #[must_use]
    pub fn blocks_per_group(&self) -> u64 {
        1_u64 << self.ag_shift.min(63)
    }

    /// Blocks occupied by the allocation bitmap (starting at block 1).
    #[must_use]
    pub fn bitmap_blocks(&self) -> u64 {
        self.num_blocks
            .div_ceil(u64::from(self.block_size).saturating_mul(8).max(1))
    }

    /// First block of the log area, `None` for an unaddressable run.
    #[must_use]
    pub fn log_first_block(&self) -> Option<BlockNumber> {
        self.log_blocks.to_block(self.ag_shift)
    }

    /// Block just past the log area; everything below it is reserved.
    #[must_use]
    pub fn reserved_end(&self) -> Option<BlockNumber> {
        self.log_blocks.end_block(self.ag_shift)
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.flags == SUPER_BLOCK_DISK_CLEAN
    }

    pub fn set_clean(&mut self, clean: bool) {
        self.flags = if clean {
            SUPER_BLOCK_DISK_CLEAN
        } else {
            SUPER_BLOCK_DISK_DIRTY
        };
    }

    #[must_use]
    pub fn has_indices(&self) -> bool {
        !self.indices.is_zero()
    }
}

fn invalid(field: &'static str, reason: &'static str) -> ParseError {
    ParseError::InvalidField { field, reason }
}

/// Longest prefix of `name` that fits the name field with a trailing NUL,
/// cut on a character boundary.
fn truncated_name(name: &str) -> &str {
    let max = VOLUME_NAME_LENGTH - 1;
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fresh(num_blocks: u64, block_size: u32) -> SuperBlock {
        SuperBlock::initialize("Test", num_blocks, BlockSize::new(block_size).unwrap())
    }

    #[test]
    fn initialized_superblock_round_trips_through_bytes() {
        let mut sb = fresh(25_600, 4096);
        sb.log_blocks = BlockRun::new(0, 2, 512);
        sb.root_dir = BlockRun::new(0, 600, 1);
        sb.indices = BlockRun::new(1, 3, 1);
        sb.log_start = 2;
        sb.log_end = 9;
        let bytes = sb.to_bytes().expect("encode");
        assert_eq!(&bytes[0x20..0x24], &SUPER_BLOCK_MAGIC1.to_le_bytes());
        assert_eq!(SuperBlock::parse_region(&bytes).expect("parse"), sb);
    }

    #[test]
    fn small_volume_geometry() {
        // 25600 4K blocks: one bitmap block, one 32768-block group.
        let sb = fresh(25_600, 4096);
        assert_eq!(sb.ag_shift, 15);
        assert_eq!(sb.num_ags, 1);
        assert_eq!(sb.blocks_per_ag, 1);
        assert_eq!(sb.bitmap_blocks(), 1);
        assert!(sb.is_valid());
        assert!(sb.is_clean());
    }

    #[test]
    fn large_volume_caps_group_count() {
        // 2^24 1K blocks = 2048 bitmap blocks; shift grows to 16.
        let sb = fresh(1 << 24, 1024);
        assert_eq!(sb.ag_shift, 16);
        assert_eq!(sb.blocks_per_ag, 8);
        assert_eq!(sb.num_ags, 256);
        assert!(sb.is_valid());
    }

    #[test]
    fn name_is_truncated_on_char_boundary() {
        let long = "é".repeat(20);
        let sb = SuperBlock::initialize(&long, 100, BlockSize::new(1024).unwrap());
        assert!(sb.name.len() <= VOLUME_NAME_LENGTH - 1);
        assert_eq!(sb.name, "é".repeat(15));
    }

    #[test]
    fn validate_reports_each_violation() {
        let good = fresh(5000, 2048);
        assert!(good.is_valid());

        let mut sb = good.clone();
        sb.magic2 = 0;
        assert!(matches!(sb.validate(), Err(ParseError::InvalidMagic { .. })));
        assert!(!sb.is_magic_valid());

        let cases: [(fn(&mut SuperBlock), &str); 8] = [
            (|sb| sb.inode_size = 1024, "inode_size"),
            (|sb| sb.fs_byte_order = 0x4547_4942, "fs_byte_order"),
            (|sb| sb.block_shift = 10, "block_shift"),
            (|sb| sb.num_ags = 0, "num_ags"),
            (|sb| sb.ag_shift = 0, "ag_shift"),
            (|sb| sb.blocks_per_ag = 0, "blocks_per_ag"),
            (|sb| sb.num_blocks = 9, "num_blocks"),
            (|sb| sb.num_ags = 2, "num_ags"),
        ];
        for (mutate, expected_field) in cases {
            let mut sb = good.clone();
            mutate(&mut sb);
            match sb.validate() {
                Err(ParseError::InvalidField { field, .. }) => assert_eq!(field, expected_field),
                other => panic!("expected {expected_field} violation, got {other:?}"),
            }
        }
    }

    #[test]
    fn unsupported_block_size_is_invalid() {
        let mut sb = fresh(5000, 1024);
        sb.block_size = 512;
        sb.inode_size = 512;
        sb.block_shift = 9;
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidField {
                field: "block_size",
                ..
            })
        ));
    }

    #[test]
    fn probe_prefers_primary_location() {
        let sb = fresh(1000, 1024);
        let mut region = [0_u8; SUPER_BLOCK_PROBE_SIZE];
        region[512..].copy_from_slice(&sb.to_bytes().expect("encode"));
        let (found, location) = SuperBlock::probe(&region).expect("probe");
        assert_eq!(found, sb);
        assert_eq!(location, SuperBlockLocation::Primary);
        assert_eq!(location.byte_offset(), 512);
    }

    #[test]
    fn probe_falls_back_to_offset_zero() {
        let sb = fresh(1000, 1024);
        let mut region = [0_u8; SUPER_BLOCK_PROBE_SIZE];
        region[..512].copy_from_slice(&sb.to_bytes().expect("encode"));
        let (found, location) = SuperBlock::probe(&region).expect("probe");
        assert_eq!(found, sb);
        assert_eq!(location, SuperBlockLocation::Alternate);
    }

    #[test]
    fn probe_reports_primary_geometry_error() {
        let mut sb = fresh(1000, 1024);
        sb.num_ags = 7;
        let mut region = [0_u8; SUPER_BLOCK_PROBE_SIZE];
        region[512..].copy_from_slice(&sb.to_bytes().expect("encode"));
        assert!(matches!(
            SuperBlock::probe(&region),
            Err(ParseError::InvalidField { field: "num_ags", .. })
        ));
    }

    #[test]
    fn probe_of_blank_region_is_bad_magic() {
        let region = [0_u8; SUPER_BLOCK_PROBE_SIZE];
        assert!(matches!(
            SuperBlock::probe(&region),
            Err(ParseError::InvalidMagic { actual: 0, .. })
        ));
        assert!(matches!(
            SuperBlock::probe(&region[..100]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn clean_flag_toggles() {
        let mut sb = fresh(1000, 1024);
        sb.set_clean(false);
        assert_eq!(sb.flags, SUPER_BLOCK_DISK_DIRTY);
        sb.set_clean(true);
        assert!(sb.is_clean());
    }

    #[test]
    fn serde_json_snapshot_is_stable() {
        let sb = fresh(1000, 1024);
        let json = serde_json::to_string(&sb).expect("serialize");
        let back: SuperBlock = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, sb);
    }

    proptest! {
        #[test]
        fn initialize_always_validates(
            size_index in 0_usize..4,
            num_blocks in MIN_BLOCK_COUNT..(1_u64 << 36),
        ) {
            let block_size = SUPPORTED_BLOCK_SIZES[size_index];
            let sb = fresh(num_blocks, block_size);
            prop_assert!(sb.is_valid(), "{sb:?}");
        }

        #[test]
        fn group_geometry_is_minimal_and_bounded(
            size_index in 0_usize..4,
            num_blocks in MIN_BLOCK_COUNT..(1_u64 << 36),
        ) {
            let block_size = SUPPORTED_BLOCK_SIZES[size_index];
            let sb = fresh(num_blocks, block_size);
            prop_assert!((MIN_AG_SHIFT..=MAX_AG_SHIFT).contains(&sb.ag_shift));
            prop_assert_eq!(
                u64::from(sb.num_ags),
                num_blocks.div_ceil(1_u64 << sb.ag_shift)
            );
            // One shift smaller would either exceed the group target or fall
            // below the block size minimum.
            let minimum = MIN_AG_SHIFT + (block_size / 1024).trailing_zeros();
            if sb.ag_shift > minimum {
                let smaller = num_blocks.div_ceil(1_u64 << (sb.ag_shift - 1));
                prop_assert!(smaller > DESIRED_ALLOCATION_GROUPS);
            }
        }
    }
}
