#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Byte offset of the primary superblock on the device.
pub const SUPER_BLOCK_OFFSET: usize = 512;
/// Size of the on-disk superblock record.
pub const SUPER_BLOCK_SIZE: usize = 512;
/// Bytes read when probing a device: the alternate location at 0 plus the primary at 512.
pub const SUPER_BLOCK_PROBE_SIZE: usize = 1024;

pub const SUPER_BLOCK_MAGIC1: u32 = 0x4246_5331; // "BFS1"
pub const SUPER_BLOCK_MAGIC2: u32 = 0xDD12_1031;
pub const SUPER_BLOCK_MAGIC3: u32 = 0x15B6_830E;
/// Byte-order tag of a little-endian volume.
pub const SUPER_BLOCK_FS_LENDIAN: u32 = 0x4249_4745; // "BIGE"
pub const SUPER_BLOCK_DISK_CLEAN: u32 = 0x434C_454E; // "CLEN"
pub const SUPER_BLOCK_DISK_DIRTY: u32 = 0x4449_5254; // "DIRT"

pub const VOLUME_NAME_LENGTH: usize = 32;
pub const MIN_BLOCK_COUNT: u64 = 10;
pub const MIN_AG_SHIFT: u32 = 13;
pub const MAX_AG_SHIFT: u32 = 16;
/// Target upper bound for the allocation group count of a fresh volume.
pub const DESIRED_ALLOCATION_GROUPS: u64 = 56;

pub const INODE_MAGIC1: u32 = 0x3BBE_0AD9;

/// Every block size a volume may be formatted with.
pub const SUPPORTED_BLOCK_SIZES: [u32; 4] = [1024, 2048, 4096, 8192];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Node identifier. The id of an inode is the linear block number holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Validated block size (a power of two in 1024..=8192).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is one of the supported sizes.
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=8192).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=8192",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Bits tracked by one block of the allocation bitmap.
    #[must_use]
    pub fn bits_per_block(self) -> u64 {
        u64::from(self.0) * 8
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> BlockNumber {
        BlockNumber(byte_offset >> u64::from(self.shift()))
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Allocation group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }

    /// Convert this block number to its byte offset using the given block size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<ByteOffset> {
        block_size.block_to_byte(self).map(ByteOffset)
    }
}

impl From<BlockNumber> for InodeId {
    fn from(block: BlockNumber) -> Self {
        Self(block.0)
    }
}

impl From<InodeId> for BlockNumber {
    fn from(id: InodeId) -> Self {
        Self(id.0)
    }
}

// ── Block runs ──────────────────────────────────────────────────────────────

/// A contiguous extent of blocks inside one allocation group.
///
/// Stored on disk as 8 bytes: `allocation_group: i32`, `start: u16`,
/// `length: u16`. The all-zero run doubles as "no run".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockRun {
    pub allocation_group: i32,
    pub start: u16,
    pub length: u16,
}

impl BlockRun {
    pub const SIZE: usize = 8;
    pub const ZERO: Self = Self::new(0, 0, 0);

    #[must_use]
    pub const fn new(allocation_group: i32, start: u16, length: u16) -> Self {
        Self {
            allocation_group,
            start,
            length,
        }
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    /// Single-block run addressing `block`.
    ///
    /// `ag_shift` must not exceed [`MAX_AG_SHIFT`], so the in-group offset
    /// always fits the 16-bit `start` field.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn from_block(block: BlockNumber, ag_shift: u32) -> Self {
        let mask = (1_u64 << ag_shift) - 1;
        Self {
            allocation_group: (block.0 >> ag_shift) as i32,
            start: (block.0 & mask) as u16,
            length: 1,
        }
    }

    /// Linear block number of the first block, `None` for a negative group.
    #[must_use]
    pub fn to_block(self, ag_shift: u32) -> Option<BlockNumber> {
        let group = u64::try_from(self.allocation_group).ok()?;
        group
            .checked_shl(ag_shift)?
            .checked_add(u64::from(self.start))
            .map(BlockNumber)
    }

    /// Linear block number one past the last block of the run.
    #[must_use]
    pub fn end_block(self, ag_shift: u32) -> Option<BlockNumber> {
        self.to_block(ag_shift)?.checked_add(u64::from(self.length))
    }

    /// Exclusive end of the run inside its group.
    #[must_use]
    pub fn end(self) -> u32 {
        u32::from(self.start) + u32::from(self.length)
    }

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            allocation_group: read_le_i32(data, offset)?,
            start: read_le_u16(data, offset + 4)?,
            length: read_le_u16(data, offset + 6)?,
        })
    }

    pub fn write_to(self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_i32(data, offset, self.allocation_group)?;
        write_le_u16(data, offset + 4, self.start)?;
        write_le_u16(data, offset + 6, self.length)
    }
}

impl fmt::Display for BlockRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.allocation_group, self.start, self.length
        )
    }
}

// ── Parse errors and little-endian field access ─────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = checked_end(data.len(), offset, len)?;
    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let end = checked_end(data.len(), offset, len)?;
    Ok(&mut data[offset..end])
}

fn checked_end(available: usize, offset: usize, len: usize) -> Result<usize, ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > available {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: available.saturating_sub(offset),
        });
    }
    Ok(end)
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    Ok(i32::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_le_bytes(read_fixed(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    write_bytes(data, offset, &value.to_le_bytes())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Mode bits ───────────────────────────────────────────────────────────────

/// File type mask.
pub const S_IFMT: u32 = 0o170_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;

/// Attribute directory.
pub const S_ATTR_DIR: u32 = 0o1_000_000_000;
/// Attribute.
pub const S_ATTR: u32 = 0o2_000_000_000;
/// Index, or the indices directory itself.
pub const S_INDEX_DIR: u32 = 0o4_000_000_000;
pub const S_STR_INDEX: u32 = 0o0_100_000_000;
pub const S_INT_INDEX: u32 = 0o0_200_000_000;
pub const S_UINT_INDEX: u32 = 0o0_400_000_000;
pub const S_LONG_LONG_INDEX: u32 = 0o0_010_000_000;
pub const S_ULONG_LONG_INDEX: u32 = 0o0_020_000_000;
pub const S_FLOAT_INDEX: u32 = 0o0_040_000_000;
pub const S_DOUBLE_INDEX: u32 = 0o0_001_000_000;

#[must_use]
pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

// ── Attribute type codes ────────────────────────────────────────────────────

/// Four-character attribute type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeCode(pub u32);

impl TypeCode {
    pub const STRING: Self = Self(0x4353_5452); // 'CSTR'
    pub const INT32: Self = Self(0x4C4F_4E47); // 'LONG'
    pub const UINT32: Self = Self(0x554C_4E47); // 'ULNG'
    pub const INT64: Self = Self(0x4C4C_4E47); // 'LLNG'
    pub const UINT64: Self = Self(0x554C_4C47); // 'ULLG'
    pub const FLOAT: Self = Self(0x464C_4F54); // 'FLOT'
    pub const DOUBLE: Self = Self(0x4442_4C45); // 'DBLE'

    /// Mode bits of an index keyed by this type, `None` if it cannot be indexed.
    #[must_use]
    pub fn index_mode(self) -> Option<u32> {
        match self {
            Self::STRING => Some(S_STR_INDEX),
            Self::INT32 => Some(S_INT_INDEX),
            Self::UINT32 => Some(S_UINT_INDEX),
            Self::INT64 => Some(S_LONG_LONG_INDEX),
            Self::UINT64 => Some(S_ULONG_LONG_INDEX),
            Self::FLOAT => Some(S_FLOAT_INDEX),
            Self::DOUBLE => Some(S_DOUBLE_INDEX),
            _ => None,
        }
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        if bytes.iter().all(u8::is_ascii_graphic) {
            write!(f, "{}", String::from_utf8_lossy(&bytes))
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(
            read_le_i32(&bytes, 4).expect("i32"),
            i32::from_le_bytes([0xEF, 0xCD, 0xAB, 0x90])
        );
    }

    #[test]
    fn test_write_helpers_bounds() {
        let mut buf = [0_u8; 6];
        write_le_u32(&mut buf, 2, 0xAABB_CCDD).expect("fits");
        assert_eq!(buf, [0, 0, 0xDD, 0xCC, 0xBB, 0xAA]);
        let err = write_le_u32(&mut buf, 4, 1).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_trim_nul_padded() {
        let raw = b"bfs\0\0\0\0";
        assert_eq!(trim_nul_padded(raw), "bfs");
    }

    #[test]
    fn test_block_size_validation() {
        for size in SUPPORTED_BLOCK_SIZES {
            assert_eq!(BlockSize::new(size).expect("supported").get(), size);
        }
        assert_eq!(BlockSize::new(4096).unwrap().shift(), 12);
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(16_384).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn test_block_size_conversions() {
        let bs = BlockSize::new(2048).unwrap();
        assert_eq!(bs.byte_to_block(4095), BlockNumber(1));
        assert_eq!(bs.block_to_byte(BlockNumber(3)), Some(6144));
        assert_eq!(bs.bits_per_block(), 16_384);
    }

    #[test]
    fn block_run_layout_is_little_endian() {
        let run = BlockRun::new(3, 0x0102, 7);
        let mut buf = [0_u8; BlockRun::SIZE];
        run.write_to(&mut buf, 0).expect("write");
        assert_eq!(buf, [3, 0, 0, 0, 0x02, 0x01, 7, 0]);
        assert_eq!(BlockRun::parse(&buf, 0).expect("parse"), run);
    }

    #[test]
    fn block_run_zero_and_display() {
        assert!(BlockRun::ZERO.is_zero());
        assert!(!BlockRun::new(0, 0, 1).is_zero());
        assert_eq!(BlockRun::new(2, 10, 4).to_string(), "(2, 10, 4)");
    }

    #[test]
    fn negative_group_has_no_block() {
        assert_eq!(BlockRun::new(-1, 0, 1).to_block(13), None);
        assert_eq!(BlockRun::new(2, 5, 3).end_block(13), Some(BlockNumber(16_392)));
    }

    #[test]
    fn type_code_display_and_index_modes() {
        assert_eq!(TypeCode::STRING.to_string(), "CSTR");
        assert_eq!(TypeCode::UINT64.to_string(), "ULLG");
        assert_eq!(TypeCode::INT64.index_mode(), Some(S_LONG_LONG_INDEX));
        assert_eq!(TypeCode(0x1234).index_mode(), None);
    }

    #[test]
    fn mode_helpers() {
        assert!(is_dir(S_IFDIR | 0o755));
        assert!(is_dir(S_INDEX_DIR | S_STR_INDEX | S_IFDIR));
        assert!(!is_dir(S_IFREG | 0o644));
    }

    proptest! {
        #[test]
        fn block_run_round_trips_linear_blocks(
            ag_shift in MIN_AG_SHIFT..=MAX_AG_SHIFT,
            block in 0_u64..(1_u64 << 40),
        ) {
            let run = BlockRun::from_block(BlockNumber(block), ag_shift);
            prop_assert_eq!(run.length, 1);
            prop_assert!(u32::from(run.start) < (1_u32 << ag_shift));
            prop_assert_eq!(run.to_block(ag_shift), Some(BlockNumber(block)));
        }
    }
}
