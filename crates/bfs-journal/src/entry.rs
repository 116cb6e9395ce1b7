//! Log entry header codec.
//!
//! An entry is one header block followed by `count` data blocks, stored in
//! consecutive (wrapping) log slots.
//!
//! ```text
//! Header block:
//! +------------------+---------+
//! | magic            | 4 bytes | = 0x424C_4F47 ("BLOG")
//! | count            | 4 bytes | data blocks that follow
//! | txn_id           | 8 bytes |
//! | header_crc       | 4 bytes | CRC32c of bytes 20 .. 32 + count * 12
//! | position         | 8 bytes | log position of this header
//! | reserved         | 4 bytes | = 0
//! +------------------+---------+
//! | For each block:            |
//! |   home block     | 8 bytes |
//! |   data crc       | 4 bytes | CRC32c of the logged block contents
//! +------------------+---------+
//! ```

use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, TxnId};

pub const ENTRY_MAGIC: u32 = 0x424C_4F47;
pub const HEADER_FIXED_SIZE: usize = 32;
pub const BLOCK_RECORD_SIZE: usize = 12;

const CRC_OFFSET: usize = 16;
const CRC_COVERED_START: usize = 20;

/// Home location and checksum of one logged block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    pub home: BlockNumber,
    pub crc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub txn_id: TxnId,
    pub position: u64,
    pub blocks: Vec<BlockRecord>,
}

/// Data blocks one header block can describe.
#[must_use]
pub fn max_blocks_per_entry(block_size: usize) -> usize {
    block_size.saturating_sub(HEADER_FIXED_SIZE) / BLOCK_RECORD_SIZE
}

impl EntryHeader {
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>> {
        if self.blocks.is_empty() || self.blocks.len() > max_blocks_per_entry(block_size) {
            return Err(BfsError::Format(format!(
                "log entry holds {} blocks, limit is {}",
                self.blocks.len(),
                max_blocks_per_entry(block_size)
            )));
        }
        let count = u32::try_from(self.blocks.len())
            .map_err(|_| BfsError::Format("log entry count exceeds u32".to_owned()))?;

        let mut buf = vec![0_u8; block_size];
        buf[0..4].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&count.to_le_bytes());
        buf[8..16].copy_from_slice(&self.txn_id.0.to_le_bytes());
        buf[20..28].copy_from_slice(&self.position.to_le_bytes());
        let mut offset = HEADER_FIXED_SIZE;
        for record in &self.blocks {
            buf[offset..offset + 8].copy_from_slice(&record.home.0.to_le_bytes());
            buf[offset + 8..offset + 12].copy_from_slice(&record.crc.to_le_bytes());
            offset += BLOCK_RECORD_SIZE;
        }
        let crc = crc32c::crc32c(&buf[CRC_COVERED_START..offset]);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decode and verify a header expected at log position `position`.
    ///
    /// `log_block` is the device block the header was read from, used only
    /// for error reporting.
    pub fn decode(buf: &[u8], position: u64, log_block: BlockNumber) -> Result<Self> {
        let corrupt = |detail: String| BfsError::Corruption {
            block: log_block.0,
            detail,
        };
        if buf.len() < HEADER_FIXED_SIZE {
            return Err(corrupt("log header block too short".to_owned()));
        }
        let magic = le_u32(buf, 0);
        if magic != ENTRY_MAGIC {
            return Err(corrupt(format!(
                "log header magic mismatch: expected {ENTRY_MAGIC:#010x}, got {magic:#010x}"
            )));
        }
        let count = usize::try_from(le_u32(buf, 4)).unwrap_or(usize::MAX);
        if count == 0 || count > max_blocks_per_entry(buf.len()) {
            return Err(corrupt(format!("log header block count {count} out of range")));
        }
        let stored_position = le_u64(buf, 20);
        if stored_position != position {
            return Err(corrupt(format!(
                "log header position mismatch: expected {position}, got {stored_position}"
            )));
        }
        let end = HEADER_FIXED_SIZE + count * BLOCK_RECORD_SIZE;
        let stored_crc = le_u32(buf, CRC_OFFSET);
        let computed_crc = crc32c::crc32c(&buf[CRC_COVERED_START..end]);
        if stored_crc != computed_crc {
            return Err(corrupt(format!(
                "log header CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
            )));
        }

        let blocks = (0..count)
            .map(|i| {
                let offset = HEADER_FIXED_SIZE + i * BLOCK_RECORD_SIZE;
                BlockRecord {
                    home: BlockNumber(le_u64(buf, offset)),
                    crc: le_u32(buf, offset + 8),
                }
            })
            .collect();
        Ok(Self {
            txn_id: TxnId(le_u64(buf, 8)),
            position,
            blocks,
        })
    }

    /// Log slots the entry occupies, header included.
    #[must_use]
    pub fn slots(&self) -> u64 {
        1 + self.blocks.len() as u64
    }
}

// Callers bounds-check before reading.
fn le_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0_u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
