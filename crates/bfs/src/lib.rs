#![forbid(unsafe_code)]
//! BFS public API facade.
//!
//! Re-exports the volume layer from `bfs-core` through one stable external
//! interface. Downstream consumers such as the CLI depend on this crate.

pub use bfs_core::*;
