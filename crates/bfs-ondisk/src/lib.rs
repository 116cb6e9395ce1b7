#![forbid(unsafe_code)]
//! On-disk format parsing for BFS structures.
//!
//! Pure parsing crate: no I/O, no side effects. Converts byte slices into
//! host-native structures (superblock, inode block, directory entry stream)
//! and back. Byte order is handled only here, at the serialize/deserialize
//! boundary; every other crate works with the typed structures.

pub mod directory;
pub mod inode;
pub mod superblock;

pub use directory::{
    DirEntry, MAX_NAME_LENGTH, encode_dir_stream, encoded_len, parse_dir_stream, validate_name,
};
pub use inode::{
    DataStream, DiskInode, INODE_IN_USE, NUM_DIRECT_BLOCKS, SmallData, decode_time, encode_time,
    small_data_capacity,
};
pub use superblock::{SuperBlock, SuperBlockLocation};
