use crate::{Inode, InodeContext};
use bfs_block::BlockRead;
use bfs_error::{BfsError, Result};
use bfs_journal::Transaction;
use bfs_types::{S_IFDIR, S_INDEX_DIR, TypeCode};

/// An attribute index: a typed directory inside the indices directory.
///
/// Only the index inode is maintained here; keys are not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    inode: Inode,
    name: String,
    type_code: TypeCode,
}

impl Index {
    pub fn create(
        txn: &mut Transaction<'_>,
        ctx: &InodeContext<'_>,
        indices: &Inode,
        name: &str,
        type_code: TypeCode,
    ) -> Result<Self> {
        let key_mode = type_code.index_mode().ok_or_else(|| {
            BfsError::Format(format!("attribute type {type_code} cannot be indexed"))
        })?;
        if !indices.is_index_directory() {
            return Err(BfsError::NotDirectory);
        }
        let mode = S_INDEX_DIR | key_mode | S_IFDIR | 0o700;
        let inode = Inode::create_with(txn, ctx, Some(indices), name, mode, |node| {
            node.index_type = type_code.0;
        })?;
        tracing::debug!(target: "bfs::inode", %name, %type_code, "index_created");
        Ok(Self {
            inode,
            name: name.to_owned(),
            type_code,
        })
    }

    pub fn open(source: &dyn BlockRead, indices: &Inode, name: &str) -> Result<Self> {
        let id = indices
            .lookup(source, name)?
            .ok_or_else(|| BfsError::NotFound(format!("index {name}")))?;
        let inode = Inode::load(source, indices.ag_shift, id)?;
        inode.init_check()?;
        if !inode.is_index_directory() {
            return Err(BfsError::Corruption {
                block: id.0,
                detail: format!("index {name} is not an index directory"),
            });
        }
        let type_code = TypeCode(inode.node().index_type);
        Ok(Self {
            inode,
            name: name.to_owned(),
            type_code,
        })
    }

    #[must_use]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn type_code(&self) -> TypeCode {
        self.type_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;
    use bfs_types::{S_IFREG, S_STR_INDEX};

    #[test]
    fn indices_are_typed_directories() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut txn = fx.journal.begin().expect("begin");
        let indices = Inode::create(
            &mut txn,
            &ctx,
            None,
            "",
            S_INDEX_DIR | S_STR_INDEX | S_IFDIR | 0o700,
        )
        .expect("indices");
        let name = Index::create(&mut txn, &ctx, &indices, "name", TypeCode::STRING)
            .expect("name index");
        Index::create(&mut txn, &ctx, &indices, "size", TypeCode::INT64).expect("size index");
        assert!(matches!(
            Index::create(&mut txn, &ctx, &indices, "size", TypeCode::INT64),
            Err(BfsError::Exists)
        ));
        assert!(matches!(
            Index::create(&mut txn, &ctx, &indices, "raw", TypeCode(0x5241_5754)),
            Err(BfsError::Format(_))
        ));
        txn.done().expect("commit");

        assert!(name.inode().is_container());
        assert_eq!(name.inode().mode() & S_STR_INDEX, S_STR_INDEX);
        let size = Index::open(fx.cache(), &indices, "size").expect("open");
        assert_eq!(size.type_code(), TypeCode::INT64);
        assert!(matches!(
            Index::open(fx.cache(), &indices, "missing"),
            Err(BfsError::NotFound(_))
        ));
    }

    #[test]
    fn plain_directory_cannot_hold_indices() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut txn = fx.journal.begin().expect("begin");
        let plain = Inode::create(&mut txn, &ctx, None, "", S_IFDIR | 0o755).expect("dir");
        assert!(matches!(
            Index::create(&mut txn, &ctx, &plain, "name", TypeCode::STRING),
            Err(BfsError::NotDirectory)
        ));
        let file = Inode::create(&mut txn, &ctx, Some(&plain), "f", S_IFREG).expect("file");
        assert!(!file.is_index_directory());
    }
}
