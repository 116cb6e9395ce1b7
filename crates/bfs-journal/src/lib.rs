#![forbid(unsafe_code)]
//! Write-ahead log for the BFS volume layer.
//!
//! Metadata changes are staged in a [`Transaction`], written to a circular
//! log area as checksummed entries, and only then installed in the block
//! cache. The log head/tail pointers are persisted through a [`LogAnchor`]
//! (the volume's superblock), so a crash between commit and checkpoint is
//! repaired by [`Journal::replay_log`] on the next mount.
//!
//! # Invariants
//!
//! - A block reaches its home location only after the log entry holding it
//!   is durable and anchored.
//! - Replay verifies every entry before applying any block.
//! - Transactions are serialized: a `Transaction` holds the journal lock
//!   for its whole lifetime.

mod entry;
mod transaction;

pub use entry::{BlockRecord, ENTRY_MAGIC, EntryHeader, max_blocks_per_entry};
pub use transaction::Transaction;

use bfs_block::BlockCache;
use bfs_error::{BfsError, Result};
use bfs_types::{BlockNumber, TxnId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Smallest usable log: one header plus a few data blocks.
pub const MIN_LOG_BLOCKS: u64 = 4;

/// Location of the log area on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogExtent {
    pub first_block: BlockNumber,
    pub length: u64,
}

impl LogExtent {
    /// Device block backing log position `position`.
    #[must_use]
    pub fn block_at(&self, position: u64) -> BlockNumber {
        BlockNumber(self.first_block.0 + position % self.length.max(1))
    }
}

/// Head (`start`) and tail (`end`) of the live log region.
///
/// Both only grow; slots are addressed modulo the log length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPointers {
    pub start: u64,
    pub end: u64,
}

impl LogPointers {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// New durable state handed to the anchor after a commit or checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorUpdate {
    pub pointers: LogPointers,
    pub used_blocks_delta: i64,
    /// The log holds no unflushed entries.
    pub clean: bool,
}

/// Durable home of the log pointers.
pub trait LogAnchor: Send + Sync {
    fn anchor(&self, update: &AnchorUpdate) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub entries: u64,
    pub blocks: u64,
    pub last_txn: Option<TxnId>,
}

struct JournalState {
    pointers: LogPointers,
    next_txn: u64,
}

pub struct Journal {
    cache: Arc<BlockCache>,
    extent: LogExtent,
    anchor: Arc<dyn LogAnchor>,
    state: Mutex<JournalState>,
    read_only: AtomicBool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("extent", &self.extent)
            .field("pointers", &self.state.lock().pointers)
            .field("read_only", &self.is_read_only())
            .finish_non_exhaustive()
    }
}

impl Journal {
    pub fn new(
        cache: Arc<BlockCache>,
        extent: LogExtent,
        pointers: LogPointers,
        anchor: Arc<dyn LogAnchor>,
    ) -> Self {
        Self {
            cache,
            extent,
            anchor,
            state: Mutex::new(JournalState {
                pointers,
                next_txn: 1,
            }),
            read_only: AtomicBool::new(false),
        }
    }

    /// Verify the log geometry and pointers are usable.
    pub fn init_check(&self) -> Result<()> {
        if self.extent.length < MIN_LOG_BLOCKS {
            return Err(BfsError::InvalidGeometry(format!(
                "log has {} blocks, need at least {MIN_LOG_BLOCKS}",
                self.extent.length
            )));
        }
        let end = self
            .extent
            .first_block
            .0
            .checked_add(self.extent.length)
            .ok_or_else(|| BfsError::InvalidGeometry("log extent overflows".to_owned()))?;
        if self.extent.first_block.0 == 0 || end > self.cache.block_count() {
            return Err(BfsError::InvalidGeometry(format!(
                "log extent {}..{end} outside volume of {} blocks",
                self.extent.first_block.0,
                self.cache.block_count()
            )));
        }
        let pointers = self.state.lock().pointers;
        if pointers.start > pointers.end || pointers.used() > self.extent.length {
            return Err(BfsError::Corruption {
                block: self.extent.first_block.0,
                detail: format!(
                    "log pointers out of range: start={} end={} length={}",
                    pointers.start, pointers.end, self.extent.length
                ),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn extent(&self) -> LogExtent {
        self.extent
    }

    #[must_use]
    pub fn pointers(&self) -> LogPointers {
        self.state.lock().pointers
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Stop flushing, refuse new transactions and refuse to commit open ones.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Start a transaction; blocks while another one is open.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        if self.is_read_only() {
            return Err(BfsError::ReadOnly);
        }
        let mut guard = self.state.lock();
        let id = TxnId(guard.next_txn);
        guard.next_txn += 1;
        tracing::trace!(target: "bfs::journal", txn = id.0, "transaction_begin");
        Ok(Transaction::new(self, guard, id))
    }

    /// Re-apply every committed entry between head and tail.
    ///
    /// Nothing is written unless every entry verifies.
    pub fn replay_log(&self) -> Result<ReplayReport> {
        let mut guard = self.state.lock();
        let pointers = guard.pointers;
        if pointers.is_empty() {
            return Ok(ReplayReport::default());
        }

        let block_size = self.block_size()?;
        let mut report = ReplayReport::default();
        let mut writes: Vec<(BlockNumber, Vec<u8>)> = Vec::new();
        let mut position = pointers.start;
        while position < pointers.end {
            let log_block = self.extent.block_at(position);
            let raw = self.cache.read_block(log_block)?;
            let header = EntryHeader::decode(raw.as_slice(), position, log_block)?;
            if position + header.slots() > pointers.end {
                return Err(BfsError::Corruption {
                    block: log_block.0,
                    detail: format!(
                        "log entry at {position} runs past log end {}",
                        pointers.end
                    ),
                });
            }
            for (i, record) in header.blocks.iter().enumerate() {
                let data_block = self.extent.block_at(position + 1 + i as u64);
                let data = self.cache.read_block(data_block)?.into_inner();
                if data.len() != block_size || crc32c::crc32c(&data) != record.crc {
                    return Err(BfsError::Corruption {
                        block: data_block.0,
                        detail: format!("logged copy of block {} fails its checksum", record.home),
                    });
                }
                if record.home.0 >= self.cache.block_count() {
                    return Err(BfsError::Corruption {
                        block: log_block.0,
                        detail: format!("logged home block {} outside volume", record.home),
                    });
                }
                writes.push((record.home, data));
            }
            report.entries += 1;
            report.blocks += header.blocks.len() as u64;
            report.last_txn = Some(header.txn_id);
            position += header.slots();
        }

        for (home, data) in &writes {
            self.cache.write_block(*home, data)?;
        }
        self.cache.flush()?;

        let next = LogPointers {
            start: pointers.end,
            end: pointers.end,
        };
        self.anchor.anchor(&AnchorUpdate {
            pointers: next,
            used_blocks_delta: 0,
            clean: true,
        })?;
        guard.pointers = next;
        if let Some(txn) = report.last_txn {
            guard.next_txn = guard.next_txn.max(txn.0 + 1);
        }
        drop(guard);

        tracing::info!(
            target: "bfs::journal",
            entries = report.entries,
            blocks = report.blocks,
            "log_replayed"
        );
        Ok(report)
    }

    /// Write every dirty block home and empty the log.
    pub fn flush_log_and_blocks(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        let mut guard = self.state.lock();
        self.flush_locked(&mut guard)
    }

    fn flush_locked(&self, state: &mut JournalState) -> Result<()> {
        let written = self.cache.flush()?;
        if !state.pointers.is_empty() {
            let next = LogPointers {
                start: state.pointers.end,
                end: state.pointers.end,
            };
            self.anchor.anchor(&AnchorUpdate {
                pointers: next,
                used_blocks_delta: 0,
                clean: true,
            })?;
            state.pointers = next;
        }
        tracing::debug!(target: "bfs::journal", blocks = written, "log_checkpointed");
        Ok(())
    }

    /// Commit staged writes; called by [`Transaction::done`].
    fn commit(
        &self,
        state: &mut JournalState,
        id: TxnId,
        staged: &[(BlockNumber, Vec<u8>)],
        used_blocks_delta: i64,
    ) -> Result<()> {
        if self.is_read_only() {
            tracing::warn!(
                target: "bfs::journal",
                txn = id.0,
                discarded = staged.len(),
                "commit_refused_read_only"
            );
            return Err(BfsError::ReadOnly);
        }
        if staged.is_empty() && used_blocks_delta == 0 {
            return Ok(());
        }
        let block_size = self.block_size()?;
        let per_entry = max_blocks_per_entry(block_size);
        let chunks: Vec<&[(BlockNumber, Vec<u8>)]> = staged.chunks(per_entry.max(1)).collect();
        let needed: u64 = chunks.iter().map(|chunk| 1 + chunk.len() as u64).sum();
        if needed > self.extent.length {
            return Err(BfsError::NoSpace);
        }
        if state.pointers.used() + needed > self.extent.length {
            self.flush_locked(state)?;
        }

        let mut position = state.pointers.end;
        for chunk in &chunks {
            let header = EntryHeader {
                txn_id: id,
                position,
                blocks: chunk
                    .iter()
                    .map(|(home, data)| BlockRecord {
                        home: *home,
                        crc: crc32c::crc32c(data),
                    })
                    .collect(),
            };
            self.cache
                .write_through(self.extent.block_at(position), &header.encode(block_size)?)?;
            for (i, (_, data)) in chunk.iter().enumerate() {
                self.cache
                    .write_through(self.extent.block_at(position + 1 + i as u64), data)?;
            }
            position += header.slots();
        }
        self.cache.sync_device()?;

        let next = LogPointers {
            start: state.pointers.start,
            end: position,
        };
        self.anchor.anchor(&AnchorUpdate {
            pointers: next,
            used_blocks_delta,
            clean: next.is_empty(),
        })?;
        state.pointers = next;

        for (home, data) in staged {
            self.cache.write_block(*home, data)?;
        }
        tracing::debug!(
            target: "bfs::journal",
            txn = id.0,
            blocks = staged.len(),
            log_slots = needed,
            "transaction_committed"
        );
        Ok(())
    }

    fn block_size(&self) -> Result<usize> {
        usize::try_from(self.cache.block_size())
            .map_err(|_| BfsError::Format("block_size does not fit usize".to_owned()))
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if self.is_read_only() {
            return;
        }
        if let Err(err) = self.flush_log_and_blocks() {
            tracing::warn!(target: "bfs::journal", error = %err, "journal_drop_flush_failed");
        }
    }
}
