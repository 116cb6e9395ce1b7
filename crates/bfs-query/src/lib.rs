#![forbid(unsafe_code)]
//! Live queries.
//!
//! A live query keeps its result set current by receiving every attribute
//! change and every rename or move on the volume. The [`QueryRegistry`]
//! only holds weak references: a query is owned by whoever opened it and
//! drops out of the registry when it is closed or dropped.
//!
//! The registry has its own lock, separate from any volume lock. It is held
//! for the whole fanout, so registration and notification never interleave
//! and every query sees every change exactly once, in mutation order.
//! Notification callbacks run under that lock and must not block.

mod predicate;

pub use predicate::{PredicateQuery, QueryEvent};

use bfs_types::{InodeId, TypeCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// A committed change of one attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub inode: InodeId,
    pub attribute: String,
    pub type_code: TypeCode,
    /// `None` if the attribute did not exist before.
    pub old: Option<Vec<u8>>,
    /// `None` if the attribute was removed.
    pub new: Option<Vec<u8>>,
}

/// A committed rename or move of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameMove {
    pub inode: InodeId,
    pub old_parent: InodeId,
    pub old_name: String,
    pub new_parent: InodeId,
    pub new_name: String,
}

pub trait LiveQuery: Send + Sync {
    fn live_update(&self, change: &AttributeChange);

    fn live_update_rename_move(&self, change: &RenameMove);

    /// Whether the query's predicate reads `attribute`.
    fn depends_on(&self, attribute: &str) -> bool;
}

/// Registered live queries.
#[derive(Default)]
pub struct QueryRegistry {
    queries: Mutex<Vec<Weak<dyn LiveQuery>>>,
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("queries", &self.len())
            .finish()
    }
}

impl QueryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `query`. Returns `false` if it was already registered.
    pub fn add(&self, query: &Arc<dyn LiveQuery>) -> bool {
        let weak = Arc::downgrade(query);
        let mut queries = self.queries.lock();
        queries.retain(|q| q.strong_count() > 0);
        if queries.iter().any(|q| Weak::ptr_eq(q, &weak)) {
            return false;
        }
        queries.push(weak);
        tracing::debug!(target: "bfs::query", registered = queries.len(), "live_query_added");
        true
    }

    /// Deregister `query`. Returns `false` if it was not registered.
    pub fn remove(&self, query: &Arc<dyn LiveQuery>) -> bool {
        let weak = Arc::downgrade(query);
        let mut queries = self.queries.lock();
        let removed = queries.iter().any(|q| Weak::ptr_eq(q, &weak));
        queries.retain(|q| !Weak::ptr_eq(q, &weak) && q.strong_count() > 0);
        tracing::debug!(target: "bfs::query", registered = queries.len(), "live_query_removed");
        removed
    }

    /// Notify every live query of an attribute change.
    ///
    /// Returns the number of queries notified.
    pub fn update_live_queries(&self, change: &AttributeChange) -> usize {
        self.fanout(|query| query.live_update(change))
    }

    pub fn update_live_queries_rename_move(&self, change: &RenameMove) -> usize {
        self.fanout(|query| query.live_update_rename_move(change))
    }

    /// Whether any registered query depends on `attribute`.
    pub fn check_for_live_query(&self, attribute: &str) -> bool {
        self.queries
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .any(|query| query.depends_on(attribute))
    }

    /// Registered queries that are still alive.
    pub fn len(&self) -> usize {
        self.queries
            .lock()
            .iter()
            .filter(|q| q.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `query` for the lifetime of the returned handle.
    pub fn open(self: &Arc<Self>, query: Arc<dyn LiveQuery>) -> LiveQueryHandle {
        self.add(&query);
        LiveQueryHandle {
            registry: Arc::downgrade(self),
            query,
        }
    }

    fn fanout(&self, notify: impl Fn(&dyn LiveQuery)) -> usize {
        let mut queries = self.queries.lock();
        let mut notified = 0;
        queries.retain(|weak| match weak.upgrade() {
            Some(query) => {
                notify(query.as_ref());
                notified += 1;
                true
            }
            None => false,
        });
        tracing::trace!(target: "bfs::query", notified, "live_queries_updated");
        notified
    }
}

/// An open live query; deregisters itself when dropped.
pub struct LiveQueryHandle {
    registry: Weak<QueryRegistry>,
    query: Arc<dyn LiveQuery>,
}

impl LiveQueryHandle {
    #[must_use]
    pub fn query(&self) -> &Arc<dyn LiveQuery> {
        &self.query
    }
}

impl std::fmt::Debug for LiveQueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQueryHandle").finish_non_exhaustive()
    }
}

impl Drop for LiveQueryHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.query);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Counting {
        updates: AtomicUsize,
        renames: AtomicUsize,
    }

    impl LiveQuery for Counting {
        fn live_update(&self, _change: &AttributeChange) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn live_update_rename_move(&self, _change: &RenameMove) {
            self.renames.fetch_add(1, Ordering::SeqCst);
        }

        fn depends_on(&self, attribute: &str) -> bool {
            attribute == "size"
        }
    }

    fn change() -> AttributeChange {
        AttributeChange {
            inode: InodeId(77),
            attribute: "size".to_owned(),
            type_code: TypeCode::INT64,
            old: None,
            new: Some(10_i64.to_le_bytes().to_vec()),
        }
    }

    #[test]
    fn two_queries_each_notified_once() {
        let registry = QueryRegistry::new();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        let a_dyn: Arc<dyn LiveQuery> = a.clone();
        let b_dyn: Arc<dyn LiveQuery> = b.clone();
        assert!(registry.add(&a_dyn));
        assert!(registry.add(&b_dyn));
        assert!(!registry.add(&a_dyn), "duplicate registration");

        assert_eq!(registry.update_live_queries(&change()), 2);
        assert_eq!(a.updates.load(Ordering::SeqCst), 1);
        assert_eq!(b.updates.load(Ordering::SeqCst), 1);
        assert_eq!(a.renames.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removed_and_dropped_queries_are_skipped() {
        let registry = QueryRegistry::new();
        let kept: Arc<dyn LiveQuery> = Arc::new(Counting::default());
        let removed: Arc<dyn LiveQuery> = Arc::new(Counting::default());
        let dropped: Arc<dyn LiveQuery> = Arc::new(Counting::default());
        registry.add(&kept);
        registry.add(&removed);
        registry.add(&dropped);
        assert!(registry.remove(&removed));
        assert!(!registry.remove(&removed));
        drop(dropped);

        assert_eq!(registry.len(), 1);
        let rename = RenameMove {
            inode: InodeId(5),
            old_parent: InodeId(1),
            old_name: "a".to_owned(),
            new_parent: InodeId(2),
            new_name: "b".to_owned(),
        };
        assert_eq!(registry.update_live_queries_rename_move(&rename), 1);
    }

    #[test]
    fn handle_deregisters_on_drop() {
        let registry = Arc::new(QueryRegistry::new());
        let handle = registry.open(Arc::new(Counting::default()));
        assert!(registry.check_for_live_query("size"));
        assert!(!registry.check_for_live_query("name"));
        assert_eq!(registry.len(), 1);
        drop(handle);
        assert!(registry.is_empty());
        assert!(!registry.check_for_live_query("size"));
    }

    #[test]
    fn concurrent_registration_and_fanout() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;
        let registry = QueryRegistry::new();
        let stable: Vec<Arc<Counting>> =
            (0..THREADS).map(|_| Arc::new(Counting::default())).collect();
        let barrier = Barrier::new(THREADS * 2);

        thread::scope(|s| {
            for query in &stable {
                let registry = &registry;
                let barrier = &barrier;
                s.spawn(move || {
                    let query: Arc<dyn LiveQuery> = query.clone();
                    barrier.wait();
                    registry.add(&query);
                    for _ in 0..ROUNDS {
                        let transient: Arc<dyn LiveQuery> = Arc::new(Counting::default());
                        assert!(registry.add(&transient));
                        assert!(registry.remove(&transient));
                    }
                });
            }
            for _ in 0..THREADS {
                let registry = &registry;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        registry.update_live_queries(&change());
                    }
                });
            }
        });

        assert_eq!(registry.len(), THREADS);
        for query in &stable {
            // Registered before or during the fanout rounds, never twice.
            assert!(query.updates.load(Ordering::SeqCst) <= THREADS * ROUNDS);
        }
        assert_eq!(registry.update_live_queries(&change()), THREADS);
        for query in &stable {
            let before = query.updates.load(Ordering::SeqCst);
            registry.update_live_queries(&change());
            assert_eq!(query.updates.load(Ordering::SeqCst), before + 1);
        }
    }
}
