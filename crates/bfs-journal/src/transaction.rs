use crate::{Journal, JournalState};
use bfs_block::{BlockBuf, BlockCache, BlockRead};
use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, TxnId};
use parking_lot::MutexGuard;
use std::collections::BTreeMap;

/// A group of block writes committed atomically.
///
/// Holds the journal lock until it is committed with [`Transaction::done`]
/// or dropped. Dropping without `done` aborts: no staged block reaches the
/// cache, the log or the device.
pub struct Transaction<'j> {
    journal: &'j Journal,
    guard: MutexGuard<'j, JournalState>,
    id: TxnId,
    staged: BTreeMap<BlockNumber, Vec<u8>>,
    used_blocks_delta: i64,
    finished: bool,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("staged", &self.staged.len())
            .field("used_blocks_delta", &self.used_blocks_delta)
            .finish_non_exhaustive()
    }
}

impl<'j> Transaction<'j> {
    pub(crate) fn new(
        journal: &'j Journal,
        guard: MutexGuard<'j, JournalState>,
        id: TxnId,
    ) -> Self {
        Self {
            journal,
            guard,
            id,
            staged: BTreeMap::new(),
            used_blocks_delta: 0,
            finished: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        self.journal.cache()
    }

    /// Stage `data` as the new content of `block`.
    pub fn write_block(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let cache = self.journal.cache();
        if usize::try_from(cache.block_size()).ok() != Some(data.len()) {
            return Err(BfsError::Format(format!(
                "staged block size mismatch: got={} expected={}",
                data.len(),
                cache.block_size()
            )));
        }
        if block.0 == 0 || block.0 >= cache.block_count() {
            return Err(BfsError::Format(format!(
                "transaction write outside volume: block={block}"
            )));
        }
        self.staged.insert(block, data.to_vec());
        Ok(())
    }

    /// Record allocator activity to be applied to the superblock on commit.
    pub fn add_used_blocks(&mut self, delta: i64) {
        self.used_blocks_delta += delta;
    }

    #[must_use]
    pub fn used_blocks_delta(&self) -> i64 {
        self.used_blocks_delta
    }

    #[must_use]
    pub fn staged_blocks(&self) -> usize {
        self.staged.len()
    }

    /// Commit every staged write.
    pub fn done(self) -> Result<TxnId> {
        self.done_then(|_| ()).map(|(id, ())| id)
    }

    /// Commit, then run `after` before the journal lock is released.
    ///
    /// `after` runs only if the commit succeeded, and no other transaction
    /// can begin until it returns.
    pub fn done_then<T>(mut self, after: impl FnOnce(TxnId) -> T) -> Result<(TxnId, T)> {
        self.finished = true;
        let staged: Vec<(BlockNumber, Vec<u8>)> =
            std::mem::take(&mut self.staged).into_iter().collect();
        self.journal
            .commit(&mut self.guard, self.id, &staged, self.used_blocks_delta)?;
        let output = after(self.id);
        Ok((self.id, output))
    }
}

impl BlockRead for Transaction<'_> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        match self.staged.get(&block) {
            Some(bytes) => Ok(BlockBuf::new(bytes.clone())),
            None => self.journal.cache().read_block(block),
        }
    }

    fn block_size(&self) -> u32 {
        self.journal.cache().block_size()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                target: "bfs::journal",
                txn = self.id.0,
                discarded = self.staged.len(),
                "transaction_aborted"
            );
        }
    }
}
