//! Inode blocks.
//!
//! Every inode occupies exactly one block (`inode_size == block_size`). The
//! fixed header is followed by a small-data area holding named attributes
//! inline:
//!
//! ```text
//! 0x00  magic1            u32
//! 0x04  inode_num         block run
//! 0x0C  uid               u32
//! 0x10  gid               u32
//! 0x14  mode              u32
//! 0x18  flags             u32
//! 0x1C  create_time       i64   (seconds << 16 | fraction)
//! 0x24  last_modified     i64
//! 0x2C  parent            block run
//! 0x34  attributes        block run
//! 0x3C  type              u32
//! 0x40  inode_size        u32
//! 0x44  etc               u32
//! 0x48  data stream       (12 direct runs, indirect, double indirect, size)
//! 0xE8  small data        entries until a zero type or the end of the block
//! ```
//!
//! Small-data entries are packed: `type u32, name_size u16, data_size u16`,
//! then `name_size` name bytes and `data_size` value bytes.

use bfs_types::{
    BlockRun, INODE_MAGIC1, ParseError, S_INDEX_DIR, TypeCode, ensure_slice, is_dir,
    read_le_i64, read_le_u16, read_le_u32, read_le_u64, write_bytes, write_le_i64, write_le_u16,
    write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const NUM_DIRECT_BLOCKS: usize = 12;
/// Inode is allocated and live.
pub const INODE_IN_USE: u32 = 0x0000_0001;
/// Fractional part of a timestamp occupies the low 16 bits.
pub const INODE_TIME_SHIFT: u32 = 16;

const DATA_STREAM_OFFSET: usize = 0x48;
const SMALL_DATA_OFFSET: usize = 0xE8;
const SMALL_DATA_HEADER: usize = 8;

/// Pack a wall-clock time into the on-disk timestamp encoding.
#[must_use]
pub fn encode_time(secs: i64, nanos: u32) -> i64 {
    (secs << INODE_TIME_SHIFT) | i64::from((nanos >> 14) & 0xFFFF)
}

/// Whole seconds of an on-disk timestamp.
#[must_use]
pub fn decode_time(stamp: i64) -> i64 {
    stamp >> INODE_TIME_SHIFT
}

/// Block map of an inode's data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStream {
    pub direct: [BlockRun; NUM_DIRECT_BLOCKS],
    pub max_direct_range: u64,
    pub indirect: BlockRun,
    pub max_indirect_range: u64,
    pub double_indirect: BlockRun,
    pub max_double_indirect_range: u64,
    pub size: u64,
}

impl DataStream {
    const SIZE: usize = NUM_DIRECT_BLOCKS * BlockRun::SIZE + 8 + 8 + 8 + 8 + 8 + 8;

    fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let mut direct = [BlockRun::ZERO; NUM_DIRECT_BLOCKS];
        for (i, run) in direct.iter_mut().enumerate() {
            *run = BlockRun::parse(data, offset + i * BlockRun::SIZE)?;
        }
        let tail = offset + NUM_DIRECT_BLOCKS * BlockRun::SIZE;
        Ok(Self {
            direct,
            max_direct_range: read_le_u64(data, tail)?,
            indirect: BlockRun::parse(data, tail + 8)?,
            max_indirect_range: read_le_u64(data, tail + 16)?,
            double_indirect: BlockRun::parse(data, tail + 24)?,
            max_double_indirect_range: read_le_u64(data, tail + 32)?,
            size: read_le_u64(data, tail + 40)?,
        })
    }

    fn write_to(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        for (i, run) in self.direct.iter().enumerate() {
            run.write_to(data, offset + i * BlockRun::SIZE)?;
        }
        let tail = offset + NUM_DIRECT_BLOCKS * BlockRun::SIZE;
        write_le_u64(data, tail, self.max_direct_range)?;
        self.indirect.write_to(data, tail + 8)?;
        write_le_u64(data, tail + 16, self.max_indirect_range)?;
        self.double_indirect.write_to(data, tail + 24)?;
        write_le_u64(data, tail + 32, self.max_double_indirect_range)?;
        write_le_u64(data, tail + 40, self.size)
    }

    /// Direct runs in use, in file order.
    pub fn runs(&self) -> impl Iterator<Item = BlockRun> + '_ {
        self.direct.iter().copied().take_while(|run| !run.is_zero())
    }
}

/// One inline attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmallData {
    pub type_code: TypeCode,
    pub name: String,
    pub value: Vec<u8>,
}

impl SmallData {
    fn encoded_len(&self) -> usize {
        SMALL_DATA_HEADER + self.name.len() + self.value.len()
    }
}

/// Host-native inode block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInode {
    pub inode_num: BlockRun,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u32,
    pub create_time: i64,
    pub last_modified_time: i64,
    pub parent: BlockRun,
    pub attributes: BlockRun,
    /// Key type of an index directory, zero otherwise.
    pub index_type: u32,
    pub inode_size: u32,
    pub data: DataStream,
    pub small_data: Vec<SmallData>,
}

impl DiskInode {
    #[must_use]
    pub fn new(
        inode_num: BlockRun,
        parent: BlockRun,
        mode: u32,
        inode_size: u32,
        now: i64,
    ) -> Self {
        Self {
            inode_num,
            uid: 0,
            gid: 0,
            mode,
            flags: INODE_IN_USE,
            create_time: now,
            last_modified_time: now,
            parent,
            attributes: BlockRun::ZERO,
            index_type: 0,
            inode_size,
            data: DataStream::default(),
            small_data: Vec::new(),
        }
    }

    /// Parse an inode block, checking the magic and the fixed header.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(block, 0, SMALL_DATA_OFFSET)?;
        let magic = read_le_u32(block, 0x00)?;
        if magic != INODE_MAGIC1 {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(INODE_MAGIC1),
                actual: u64::from(magic),
            });
        }
        let inode_size = read_le_u32(block, 0x40)?;
        if usize::try_from(inode_size).ok() != Some(block.len()) {
            return Err(ParseError::InvalidField {
                field: "inode_size",
                reason: "does not match the block size",
            });
        }

        Ok(Self {
            inode_num: BlockRun::parse(block, 0x04)?,
            uid: read_le_u32(block, 0x0C)?,
            gid: read_le_u32(block, 0x10)?,
            mode: read_le_u32(block, 0x14)?,
            flags: read_le_u32(block, 0x18)?,
            create_time: read_le_i64(block, 0x1C)?,
            last_modified_time: read_le_i64(block, 0x24)?,
            parent: BlockRun::parse(block, 0x2C)?,
            attributes: BlockRun::parse(block, 0x34)?,
            index_type: read_le_u32(block, 0x3C)?,
            inode_size,
            data: DataStream::parse(block, DATA_STREAM_OFFSET)?,
            small_data: parse_small_data(block)?,
        })
    }

    /// Serialize into a full block of `block_size` bytes.
    pub fn to_block(&self, block_size: usize) -> Result<Vec<u8>, ParseError> {
        if self.small_data_len() > small_data_capacity(block_size) {
            return Err(ParseError::InvalidField {
                field: "small_data",
                reason: "does not fit the inode block",
            });
        }
        let mut block = vec![0_u8; block_size];
        write_le_u32(&mut block, 0x00, INODE_MAGIC1)?;
        self.inode_num.write_to(&mut block, 0x04)?;
        write_le_u32(&mut block, 0x0C, self.uid)?;
        write_le_u32(&mut block, 0x10, self.gid)?;
        write_le_u32(&mut block, 0x14, self.mode)?;
        write_le_u32(&mut block, 0x18, self.flags)?;
        write_le_i64(&mut block, 0x1C, self.create_time)?;
        write_le_i64(&mut block, 0x24, self.last_modified_time)?;
        self.parent.write_to(&mut block, 0x2C)?;
        self.attributes.write_to(&mut block, 0x34)?;
        write_le_u32(&mut block, 0x3C, self.index_type)?;
        write_le_u32(&mut block, 0x40, self.inode_size)?;
        self.data.write_to(&mut block, DATA_STREAM_OFFSET)?;

        let mut offset = SMALL_DATA_OFFSET;
        for entry in &self.small_data {
            let name_size = u16::try_from(entry.name.len()).map_err(|_| {
                ParseError::IntegerConversion {
                    field: "small_data.name_size",
                }
            })?;
            let data_size = u16::try_from(entry.value.len()).map_err(|_| {
                ParseError::IntegerConversion {
                    field: "small_data.data_size",
                }
            })?;
            write_le_u32(&mut block, offset, entry.type_code.0)?;
            write_le_u16(&mut block, offset + 4, name_size)?;
            write_le_u16(&mut block, offset + 6, data_size)?;
            write_bytes(&mut block, offset + SMALL_DATA_HEADER, entry.name.as_bytes())?;
            write_bytes(
                &mut block,
                offset + SMALL_DATA_HEADER + entry.name.len(),
                &entry.value,
            )?;
            offset += entry.encoded_len();
        }
        Ok(block)
    }

    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.flags & INODE_IN_USE != 0
    }

    #[must_use]
    pub fn is_container(&self) -> bool {
        is_dir(self.mode)
    }

    #[must_use]
    pub fn is_index_directory(&self) -> bool {
        self.mode & S_INDEX_DIR != 0
    }

    #[must_use]
    pub fn small_data(&self, name: &str) -> Option<&SmallData> {
        self.small_data.iter().find(|entry| entry.name == name)
    }

    /// Bytes the small-data entries occupy when serialized.
    #[must_use]
    pub fn small_data_len(&self) -> usize {
        self.small_data.iter().map(SmallData::encoded_len).sum()
    }
}

/// Bytes available for small data in an inode block of `block_size`.
#[must_use]
pub fn small_data_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(SMALL_DATA_OFFSET)
}

fn parse_small_data(block: &[u8]) -> Result<Vec<SmallData>, ParseError> {
    let mut entries = Vec::new();
    let mut offset = SMALL_DATA_OFFSET;
    while offset + SMALL_DATA_HEADER <= block.len() {
        let type_code = read_le_u32(block, offset)?;
        if type_code == 0 {
            break;
        }
        let name_size = usize::from(read_le_u16(block, offset + 4)?);
        let data_size = usize::from(read_le_u16(block, offset + 6)?);
        let name_bytes = ensure_slice(block, offset + SMALL_DATA_HEADER, name_size)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| ParseError::InvalidField {
                field: "small_data.name",
                reason: "not UTF-8",
            })?
            .to_owned();
        let value = ensure_slice(block, offset + SMALL_DATA_HEADER + name_size, data_size)?;
        entries.push(SmallData {
            type_code: TypeCode(type_code),
            name,
            value: value.to_vec(),
        });
        offset += SMALL_DATA_HEADER + name_size + data_size;
    }
    Ok(entries)
}

const _: () = assert!(DATA_STREAM_OFFSET + DataStream::SIZE <= SMALL_DATA_OFFSET);

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_types::{S_IFDIR, S_IFREG};

    fn sample() -> DiskInode {
        let mut inode = DiskInode::new(
            BlockRun::new(0, 40, 1),
            BlockRun::new(0, 39, 1),
            S_IFDIR | 0o755,
            2048,
            encode_time(1_700_000_000, 500_000_000),
        );
        inode.data.direct[0] = BlockRun::new(0, 41, 2);
        inode.data.size = 300;
        inode.small_data.push(SmallData {
            type_code: TypeCode::STRING,
            name: "BEOS:TYPE".to_owned(),
            value: b"application/x-vnd.test".to_vec(),
        });
        inode
    }

    #[test]
    fn inode_block_round_trips() {
        let inode = sample();
        let block = inode.to_block(2048).expect("serialize");
        assert_eq!(block.len(), 2048);
        let parsed = DiskInode::parse(&block).expect("parse");
        assert_eq!(parsed, inode);
        assert!(parsed.is_in_use());
        assert!(parsed.is_container());
        assert_eq!(parsed.data.runs().collect::<Vec<_>>(), vec![BlockRun::new(0, 41, 2)]);
        assert_eq!(
            parsed.small_data("BEOS:TYPE").map(|e| e.value.len()),
            Some(22)
        );
    }

    #[test]
    fn blank_block_is_bad_magic() {
        assert!(matches!(
            DiskInode::parse(&[0_u8; 1024]),
            Err(ParseError::InvalidMagic { actual: 0, .. })
        ));
    }

    #[test]
    fn inode_size_must_match_block() {
        let block = sample().to_block(2048).expect("serialize");
        assert!(matches!(
            DiskInode::parse(&block[..1024]),
            Err(ParseError::InvalidField {
                field: "inode_size",
                ..
            })
        ));
    }

    #[test]
    fn oversized_small_data_is_rejected() {
        let mut inode = DiskInode::new(BlockRun::new(0, 5, 1), BlockRun::ZERO, S_IFREG, 1024, 0);
        inode.small_data.push(SmallData {
            type_code: TypeCode::UINT64,
            name: "big".to_owned(),
            value: vec![0xAA; small_data_capacity(1024)],
        });
        assert!(inode.to_block(1024).is_err());
        inode.small_data[0].value.truncate(small_data_capacity(1024) - 11);
        let block = inode.to_block(1024).expect("fits exactly");
        assert_eq!(DiskInode::parse(&block).expect("parse"), inode);
    }

    #[test]
    fn timestamps_keep_whole_seconds() {
        let stamp = encode_time(1_234_567, 999_999_999);
        assert_eq!(decode_time(stamp), 1_234_567);
        assert!(stamp & 0xFFFF > 0);
    }
}
