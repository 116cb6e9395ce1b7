//! Named attributes stored inline in the inode's small-data area.

use crate::{Inode, InodeContext, now};
use bfs_block::BlockRead;
use bfs_error::{BfsError, Result};
use bfs_journal::Transaction;
use bfs_ondisk::{SmallData, small_data_capacity};
use bfs_types::{InodeId, TypeCode};
use serde::{Deserialize, Serialize};

const MAX_ATTRIBUTE_NAME: usize = 255;

/// How [`Attribute::create`] treats an attribute that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Keep the current value.
    #[default]
    Open,
    /// Discard the current value on the first write.
    Truncate,
    /// Fail with [`BfsError::Exists`].
    Exclusive,
}

/// Handle returned by [`Attribute::create`] and consumed by writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeCookie {
    name: String,
    type_code: TypeCode,
    created: bool,
    truncate: bool,
}

impl AttributeCookie {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn type_code(&self) -> TypeCode {
        self.type_code
    }

    /// Whether the attribute did not exist before `create`.
    #[must_use]
    pub fn created(&self) -> bool {
        self.created
    }
}

/// Old and new value of an attribute after a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub inode: InodeId,
    pub name: String,
    pub type_code: TypeCode,
    /// `None` when the write created the attribute.
    pub old: Option<Vec<u8>>,
    pub new: Vec<u8>,
}

/// Attribute operations on one inode.
#[derive(Debug, Clone, Copy)]
pub struct Attribute<'i> {
    inode: &'i Inode,
}

impl<'i> Attribute<'i> {
    #[must_use]
    pub fn new(inode: &'i Inode) -> Self {
        Self { inode }
    }

    pub fn create(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        name: &str,
        type_code: TypeCode,
        mode: CreateMode,
    ) -> Result<AttributeCookie> {
        check_attribute_name(name)?;
        let mut node = self.inode.read_node(txn)?;
        let exists = node.small_data(name).is_some();
        if exists && mode == CreateMode::Exclusive {
            return Err(BfsError::Exists);
        }
        if !exists {
            node.small_data.push(SmallData {
                type_code,
                name: name.to_owned(),
                value: Vec::new(),
            });
            if node.small_data_len() > small_data_capacity(ctx.block_size.as_usize()) {
                return Err(BfsError::NoSpace);
            }
            self.inode.store(txn, ctx, &node)?;
        }
        Ok(AttributeCookie {
            name: name.to_owned(),
            type_code,
            created: !exists,
            truncate: exists && mode == CreateMode::Truncate,
        })
    }

    /// Write `data` at byte `offset` of the attribute value, zero-filling
    /// any gap.
    pub fn write(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        cookie: &mut AttributeCookie,
        offset: usize,
        data: &[u8],
    ) -> Result<AttributeUpdate> {
        let mut node = self.inode.read_node(txn)?;
        let entry = node
            .small_data
            .iter_mut()
            .find(|entry| entry.name == cookie.name)
            .ok_or_else(|| BfsError::NotFound(cookie.name.clone()))?;

        let old = (!cookie.created).then(|| entry.value.clone());
        if cookie.truncate {
            entry.value.clear();
        }
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= usize::from(u16::MAX))
            .ok_or(BfsError::NoSpace)?;
        if entry.value.len() < end {
            entry.value.resize(end, 0);
        }
        entry.value[offset..end].copy_from_slice(data);
        entry.type_code = cookie.type_code;
        let new = entry.value.clone();

        if node.small_data_len() > small_data_capacity(ctx.block_size.as_usize()) {
            return Err(BfsError::NoSpace);
        }
        node.last_modified_time = now();
        self.inode.store(txn, ctx, &node)?;
        cookie.created = false;
        cookie.truncate = false;

        tracing::trace!(
            target: "bfs::inode",
            inode = self.inode.id().0,
            name = %cookie.name,
            len = new.len(),
            "attribute_written"
        );
        Ok(AttributeUpdate {
            inode: self.inode.id(),
            name: cookie.name.clone(),
            type_code: cookie.type_code,
            old,
            new,
        })
    }

    pub fn read(&self, source: &dyn BlockRead, name: &str) -> Result<Option<SmallData>> {
        let node = self.inode.read_node(source)?;
        Ok(node.small_data(name).cloned())
    }

    pub fn list(&self, source: &dyn BlockRead) -> Result<Vec<SmallData>> {
        Ok(self.inode.read_node(source)?.small_data)
    }

    /// Delete `name`, returning its last value.
    pub fn remove(
        &self,
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        name: &str,
    ) -> Result<SmallData> {
        let mut node = self.inode.read_node(txn)?;
        let pos = node
            .small_data
            .iter()
            .position(|entry| entry.name == name)
            .ok_or_else(|| BfsError::NotFound(name.to_owned()))?;
        let removed = node.small_data.remove(pos);
        self.inode.store(txn, ctx, &node)?;
        Ok(removed)
    }
}

fn check_attribute_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_ATTRIBUTE_NAME || name.contains('\0') {
        return Err(BfsError::InvalidName(format!("attribute name {name:?}")));
    }
    Ok(())
}
