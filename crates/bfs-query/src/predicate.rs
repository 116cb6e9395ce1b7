use crate::{AttributeChange, LiveQuery, RenameMove};
use bfs_types::InodeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Attribute that rename/move notifications are evaluated against.
const NAME_ATTRIBUTE: &str = "name";

/// Result-set transition of a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryEvent {
    Entered(InodeId),
    Left(InodeId),
}

type Predicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A live query matching inodes whose `attribute` satisfies a predicate
/// over the raw value bytes.
pub struct PredicateQuery {
    attribute: String,
    predicate: Predicate,
    state: Mutex<QueryState>,
}

#[derive(Default)]
struct QueryState {
    matches: BTreeSet<InodeId>,
    events: Vec<QueryEvent>,
    notifications: u64,
}

impl std::fmt::Debug for PredicateQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PredicateQuery")
            .field("attribute", &self.attribute)
            .field("matches", &state.matches.len())
            .field("events", &state.events.len())
            .finish_non_exhaustive()
    }
}

impl PredicateQuery {
    pub fn new(
        attribute: impl Into<String>,
        predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            predicate: Box::new(predicate),
            state: Mutex::new(QueryState::default()),
        }
    }

    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Seed the result set with an inode found by an initial scan.
    pub fn seed(&self, inode: InodeId, value: &[u8]) {
        if (self.predicate)(value) {
            self.state.lock().matches.insert(inode);
        }
    }

    #[must_use]
    pub fn matches(&self) -> Vec<InodeId> {
        self.state.lock().matches.iter().copied().collect()
    }

    /// Transitions in the order they happened.
    #[must_use]
    pub fn events(&self) -> Vec<QueryEvent> {
        self.state.lock().events.clone()
    }

    /// Notifications received, relevant or not.
    #[must_use]
    pub fn notifications(&self) -> u64 {
        self.state.lock().notifications
    }

    fn apply(&self, inode: InodeId, now_matches: bool) {
        let mut state = self.state.lock();
        let was_matching = state.matches.contains(&inode);
        if now_matches && !was_matching {
            state.matches.insert(inode);
            state.events.push(QueryEvent::Entered(inode));
        } else if !now_matches && was_matching {
            state.matches.remove(&inode);
            state.events.push(QueryEvent::Left(inode));
        }
    }
}

impl LiveQuery for PredicateQuery {
    fn live_update(&self, change: &AttributeChange) {
        self.state.lock().notifications += 1;
        if change.attribute != self.attribute {
            return;
        }
        let now_matches = change.new.as_deref().is_some_and(|value| (self.predicate)(value));
        self.apply(change.inode, now_matches);
    }

    fn live_update_rename_move(&self, change: &RenameMove) {
        self.state.lock().notifications += 1;
        if self.attribute != NAME_ATTRIBUTE {
            return;
        }
        let now_matches = (self.predicate)(change.new_name.as_bytes());
        self.apply(change.inode, now_matches);
    }

    fn depends_on(&self, attribute: &str) -> bool {
        self.attribute == attribute
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_types::TypeCode;

    fn size_change(inode: u64, old: Option<i64>, new: Option<i64>) -> AttributeChange {
        AttributeChange {
            inode: InodeId(inode),
            attribute: "size".to_owned(),
            type_code: TypeCode::INT64,
            old: old.map(|v| v.to_le_bytes().to_vec()),
            new: new.map(|v| v.to_le_bytes().to_vec()),
        }
    }

    fn larger_than(limit: i64) -> PredicateQuery {
        PredicateQuery::new("size", move |value: &[u8]| {
            <[u8; 8]>::try_from(value).is_ok_and(|bytes| i64::from_le_bytes(bytes) > limit)
        })
    }

    #[test]
    fn inodes_enter_and_leave_in_order() {
        let query = larger_than(100);
        query.live_update(&size_change(1, None, Some(50)));
        query.live_update(&size_change(1, Some(50), Some(500)));
        query.live_update(&size_change(2, None, Some(1000)));
        query.live_update(&size_change(1, Some(500), None));
        assert_eq!(
            query.events(),
            [
                QueryEvent::Entered(InodeId(1)),
                QueryEvent::Entered(InodeId(2)),
                QueryEvent::Left(InodeId(1)),
            ]
        );
        assert_eq!(query.matches(), [InodeId(2)]);
        assert_eq!(query.notifications(), 4);
    }

    #[test]
    fn unrelated_attributes_only_count() {
        let query = larger_than(0);
        let mut change = size_change(9, None, Some(5));
        change.attribute = "last_modified".to_owned();
        query.live_update(&change);
        assert!(query.events().is_empty());
        assert_eq!(query.notifications(), 1);
        assert!(query.depends_on("size"));
        assert!(!query.depends_on("last_modified"));
    }

    #[test]
    fn name_queries_follow_renames() {
        let query = PredicateQuery::new("name", |value: &[u8]| value.ends_with(b".txt"));
        query.seed(InodeId(4), b"notes.txt");
        let rename = |new_name: &str| RenameMove {
            inode: InodeId(4),
            old_parent: InodeId(1),
            old_name: "whatever".to_owned(),
            new_parent: InodeId(1),
            new_name: new_name.to_owned(),
        };
        query.live_update_rename_move(&rename("notes.md"));
        query.live_update_rename_move(&rename("final.txt"));
        assert_eq!(
            query.events(),
            [QueryEvent::Left(InodeId(4)), QueryEvent::Entered(InodeId(4))]
        );
    }

    proptest::proptest! {
        #[test]
        fn result_set_tracks_the_last_value_of_each_inode(
            updates in proptest::collection::vec(
                (0_u64..6, proptest::option::of(-50_i64..200)),
                0..64,
            ),
        ) {
            let query = larger_than(100);
            let mut last: std::collections::BTreeMap<u64, Option<i64>> = Default::default();
            for (inode, value) in updates {
                let old = last.get(&inode).copied().flatten();
                query.live_update(&size_change(inode, old, value));
                last.insert(inode, value);
            }
            let expected: Vec<InodeId> = last
                .iter()
                .filter(|(_, value)| value.is_some_and(|v| v > 100))
                .map(|(inode, _)| InodeId(*inode))
                .collect();
            proptest::prop_assert_eq!(query.matches(), expected);
            for inode in last.keys() {
                let mut inside = false;
                for event in query.events() {
                    match event {
                        QueryEvent::Entered(id) if id == InodeId(*inode) => {
                            proptest::prop_assert!(!inside);
                            inside = true;
                        }
                        QueryEvent::Left(id) if id == InodeId(*inode) => {
                            proptest::prop_assert!(inside);
                            inside = false;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
