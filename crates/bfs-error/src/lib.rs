#![forbid(unsafe_code)]
//! Error types for the BFS volume layer.
//!
//! # Error Taxonomy
//!
//! Two layers, mirroring the split between pure parsing and runtime I/O:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `bfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `BfsError` | `bfs-error` (this crate) | Errors returned by the device, cache, journal, allocator and volume |
//!
//! `bfs-error` does not depend on `bfs-types`. `bfs-core` converts a
//! `ParseError` into `BfsError` at the mount and format boundary:
//!
//! | ParseError Variant | BfsError Variant |
//! |--------------------|------------------|
//! | `InvalidMagic` | `InvalidSuperblock` while probing, `Corruption` on live metadata |
//! | `InvalidField` | `InvalidSuperblock` / `InvalidGeometry` while probing, `Corruption` on live metadata |
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! ## Severity classes
//!
//! | Class | Variants | Mount outcome |
//! |-------|----------|---------------|
//! | device I/O | `Io`, `ReadOnlyDevice` | refused |
//! | format / geometry | `InvalidSuperblock`, `InvalidGeometry`, `UnsupportedBlockSize`, `DeviceTooSmall`, `Format` | refused |
//! | resource exhaustion | `OutOfMemory`, `NoSpace` | refused |
//! | structural corruption | `Corruption` | refused at mount, read-only downgrade afterwards |
//!
//! Journal replay failure and a missing indices directory are not errors at
//! this layer; the volume reports them as degraded reasons in its mount report.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format`, `Parse`, `InvalidSuperblock`, `InvalidGeometry`, `UnsupportedBlockSize`, `DeviceTooSmall`, `InvalidName`, `InvalidState` | `EINVAL` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `ReadOnly`, `ReadOnlyDevice` | `EROFS` |
//! | `Busy` | `EBUSY` |

use thiserror::Error;

/// Unified error type for all volume operations.
#[derive(Debug, Error)]
pub enum BfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Raised for invalid block runs, checksum mismatches in the log and
    /// inode blocks that fail their init check.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format outside the superblock (inode, directory stream).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without further context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Neither superblock location holds a valid superblock.
    #[error("invalid superblock: {0}")]
    InvalidSuperblock(String),

    /// Geometry computed or read for the volume is inconsistent.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(u32),

    /// The backing device is smaller than the filesystem it claims to hold.
    #[error("device too small: {device_bytes} bytes, filesystem needs {fs_bytes}")]
    DeviceTooSmall { device_bytes: u64, fs_bytes: u64 },

    /// Volume or entry name rejected (path separator, empty, too long).
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    /// Volume is read-only (requested, degraded, or after a panic) and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The device itself refuses writes.
    #[error("device is read-only")]
    ReadOnlyDevice,

    #[error("resource busy: {0}")]
    Busy(String),

    /// Operation issued in a lifecycle state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl BfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; a new variant does not compile until its
    /// errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidSuperblock(_)
            | Self::InvalidGeometry(_)
            | Self::UnsupportedBlockSize(_)
            | Self::DeviceTooSmall { .. }
            | Self::InvalidName(_)
            | Self::InvalidState(_) => libc::EINVAL,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::ReadOnly | Self::ReadOnlyDevice => libc::EROFS,
            Self::Busy(_) => libc::EBUSY,
        }
    }

    /// Whether this error describes on-disk state rather than the environment.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `BfsError`.
pub type Result<T> = std::result::Result<T, BfsError>;
