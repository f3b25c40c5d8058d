use std::collections::BTreeSet;
use std::fmt;

/// Monotonic snapshot identifier. Allocated by [`SnapshotStore`](crate::SnapshotStore).
pub type SnapshotId = u64;

/// Process-unique identifier of a state cell.
pub type CellId = u64;

/// Never valid in any snapshot. Records of abandoned snapshots are retagged with it.
pub const INVALID_SNAPSHOT: SnapshotId = 0;

/// Set of snapshot ids a snapshot must not read through.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SnapshotIdSet {
    ids: BTreeSet<SnapshotId>,
}

impl SnapshotIdSet {
    pub const fn new() -> Self {
        Self {
            ids: BTreeSet::new(),
        }
    }

    pub fn contains(&self, id: SnapshotId) -> bool {
        self.ids.contains(&id)
    }

    pub fn insert(&mut self, id: SnapshotId) {
        self.ids.insert(id);
    }

    pub fn remove(&mut self, id: SnapshotId) {
        self.ids.remove(&id);
    }

    /// Adds every id in `from..until`.
    pub fn add_range(&mut self, from: SnapshotId, until: SnapshotId) {
        for id in from..until {
            self.ids.insert(id);
        }
    }

    pub fn union_with(&mut self, other: &SnapshotIdSet) {
        self.ids.extend(other.ids.iter().copied());
    }

    pub fn difference_with(&mut self, other: &SnapshotIdSet) {
        for id in &other.ids {
            self.ids.remove(id);
        }
    }

    /// Lowest id in the set, or `default` when the set is empty or only holds
    /// ids above it.
    pub fn lowest_or(&self, default: SnapshotId) -> SnapshotId {
        match self.ids.first() {
            Some(&lowest) if lowest < default => lowest,
            _ => default,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SnapshotId> + '_ {
        self.ids.iter().copied()
    }
}

impl fmt::Debug for SnapshotIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids.iter()).finish()
    }
}

impl FromIterator<SnapshotId> for SnapshotIdSet {
    fn from_iter<I: IntoIterator<Item = SnapshotId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// A record written in snapshot `candidate` is visible to snapshot `id` when it
/// was not abandoned, is not newer than `id`, and is not hidden by `invalid`.
pub(crate) fn valid(candidate: SnapshotId, id: SnapshotId, invalid: &SnapshotIdSet) -> bool {
    candidate != INVALID_SNAPSHOT && candidate <= id && !invalid.contains(candidate)
}
