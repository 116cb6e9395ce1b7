//! Node publishing: the layer that hands out references to live inodes.

use bfs_error::{BfsError, Result};
use bfs_inode::Inode;
use bfs_types::InodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Where a volume publishes inodes it hands out to the rest of the system.
pub trait NodePublisher: Send + Sync {
    /// Make `node` reachable as `id` with one reference held by the caller.
    fn publish(&self, id: InodeId, node: Arc<Inode>, mode: u32) -> Result<()>;

    /// Drop one reference to `id`.
    fn put(&self, id: InodeId) -> Result<()>;
}

struct Published {
    node: Arc<Inode>,
    mode: u32,
    refs: u32,
}

/// Reference-counted table of published nodes.
#[derive(Default)]
pub struct NodeTable {
    nodes: Mutex<HashMap<InodeId, Published>>,
}

impl std::fmt::Debug for NodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTable")
            .field("published", &self.nodes.lock().len())
            .finish()
    }
}

impl NodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take another reference to a published node.
    pub fn acquire(&self, id: InodeId) -> Result<Arc<Inode>> {
        let mut nodes = self.nodes.lock();
        let entry = nodes
            .get_mut(&id)
            .ok_or_else(|| BfsError::NotFound(format!("node {id}")))?;
        entry.refs += 1;
        Ok(Arc::clone(&entry.node))
    }

    #[must_use]
    pub fn ref_count(&self, id: InodeId) -> Option<u32> {
        self.nodes.lock().get(&id).map(|entry| entry.refs)
    }

    #[must_use]
    pub fn mode(&self, id: InodeId) -> Option<u32> {
        self.nodes.lock().get(&id).map(|entry| entry.mode)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodePublisher for NodeTable {
    fn publish(&self, id: InodeId, node: Arc<Inode>, mode: u32) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&id) {
            return Err(BfsError::Exists);
        }
        nodes.insert(id, Published { node, mode, refs: 1 });
        tracing::trace!(target: "bfs::volume", node = id.0, "node_published");
        Ok(())
    }

    fn put(&self, id: InodeId) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let entry = nodes
            .get_mut(&id)
            .ok_or_else(|| BfsError::NotFound(format!("node {id}")))?;
        entry.refs -= 1;
        if entry.refs == 0 {
            nodes.remove(&id);
            tracing::trace!(target: "bfs::volume", node = id.0, "node_released");
        }
        Ok(())
    }
}
