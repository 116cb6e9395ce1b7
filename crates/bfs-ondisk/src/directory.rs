//! Directory entry streams.
//!
//! A directory's data stream holds a flat, name-sorted list of entries:
//!
//! ```text
//! 0x00  magic   u32  "BDIR"
//! 0x04  count   u32
//! 0x08  entries      (inode u64, name_len u16, name bytes)*
//! ```

use bfs_types::{
    InodeId, ParseError, ensure_slice, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

pub const DIR_STREAM_MAGIC: u32 = 0x4244_4952;
pub const MAX_NAME_LENGTH: usize = 255;

const HEADER_SIZE: usize = 8;
const ENTRY_HEADER_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeId,
}

/// Check a single path component.
pub fn validate_name(name: &str) -> Result<(), ParseError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "empty or reserved",
        });
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "longer than 255 bytes",
        });
    }
    if name.contains('/') || name.contains('\0') {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "contains '/' or NUL",
        });
    }
    Ok(())
}

pub fn parse_dir_stream(bytes: &[u8]) -> Result<Vec<DirEntry>, ParseError> {
    let magic = read_le_u32(bytes, 0)?;
    if magic != DIR_STREAM_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(DIR_STREAM_MAGIC),
            actual: u64::from(magic),
        });
    }
    let count = read_le_u32(bytes, 4)?;
    let mut entries = Vec::new();
    let mut offset = HEADER_SIZE;
    for _ in 0..count {
        let inode = InodeId(read_le_u64(bytes, offset)?);
        let name_len = usize::from(read_le_u16(bytes, offset + 8)?);
        let raw = ensure_slice(bytes, offset + ENTRY_HEADER_SIZE, name_len)?;
        let name = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidField {
            field: "dir_entry.name",
            reason: "not UTF-8",
        })?;
        validate_name(name)?;
        entries.push(DirEntry {
            name: name.to_owned(),
            inode,
        });
        offset += ENTRY_HEADER_SIZE + name_len;
    }
    Ok(entries)
}

/// Serialize entries, sorted by name. Duplicate names are rejected.
pub fn encode_dir_stream(entries: &[DirEntry]) -> Result<Vec<u8>, ParseError> {
    let mut sorted: Vec<&DirEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    if sorted.windows(2).any(|pair| pair[0].name == pair[1].name) {
        return Err(ParseError::InvalidField {
            field: "dir_entry.name",
            reason: "duplicate",
        });
    }
    let count = u32::try_from(sorted.len()).map_err(|_| ParseError::IntegerConversion {
        field: "dir_entry.count",
    })?;

    let mut out = Vec::with_capacity(encoded_len(entries));
    out.extend_from_slice(&DIR_STREAM_MAGIC.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    for entry in sorted {
        validate_name(&entry.name)?;
        let name_len = u16::try_from(entry.name.len()).map_err(|_| {
            ParseError::IntegerConversion {
                field: "dir_entry.name_len",
            }
        })?;
        out.extend_from_slice(&entry.inode.0.to_le_bytes());
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(entry.name.as_bytes());
    }
    Ok(out)
}

#[must_use]
pub fn encoded_len(entries: &[DirEntry]) -> usize {
    HEADER_SIZE
        + entries
            .iter()
            .map(|entry| ENTRY_HEADER_SIZE + entry.name.len())
            .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, inode: u64) -> DirEntry {
        DirEntry {
            name: name.to_owned(),
            inode: InodeId(inode),
        }
    }

    #[test]
    fn stream_is_sorted_and_parses_back() {
        let entries = vec![entry("size", 12), entry("name", 10), entry("last_modified", 11)];
        let bytes = encode_dir_stream(&entries).expect("encode");
        assert_eq!(bytes.len(), encoded_len(&entries));
        let parsed = parse_dir_stream(&bytes).expect("parse");
        let names: Vec<_> = parsed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["last_modified", "name", "size"]);
        assert_eq!(parsed[1].inode, InodeId(10));
    }

    #[test]
    fn empty_stream_is_header_only() {
        let bytes = encode_dir_stream(&[]).expect("encode");
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert!(parse_dir_stream(&bytes).expect("parse").is_empty());
    }

    #[test]
    fn zeroed_stream_is_bad_magic() {
        assert!(matches!(
            parse_dir_stream(&[0_u8; 64]),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn truncated_stream_is_insufficient_data() {
        let bytes = encode_dir_stream(&[entry("a", 1), entry("b", 2)]).expect("encode");
        assert!(matches!(
            parse_dir_stream(&bytes[..bytes.len() - 1]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("ok").is_ok());
        for bad in ["", ".", "..", "a/b", "nul\0"] {
            assert!(validate_name(bad).is_err(), "{bad:?}");
        }
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
        assert!(encode_dir_stream(&[entry("dup", 1), entry("dup", 2)]).is_err());
    }
}
