use std::collections::BTreeMap;
use std::fmt;

use crate::{CellId, Snapshot, StateError, StateRef};

/// Cells whose writes became visible when a snapshot was applied.
#[derive(Clone, Default)]
pub struct ChangeSet {
    cells: BTreeMap<CellId, StateRef>,
}

impl ChangeSet {
    pub(crate) fn new(cells: BTreeMap<CellId, StateRef>) -> Self {
        Self { cells }
    }

    pub fn contains(&self, cell: CellId) -> bool {
        self.cells.contains_key(&cell)
    }

    /// Cell ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells.keys().copied()
    }

    pub fn states(&self) -> impl Iterator<Item = &StateRef> {
        self.cells.values()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.cells.keys()).finish()
    }
}

/// Outcome of [`Snapshot::apply`].
#[derive(Debug)]
pub enum ApplyResult {
    Success(ChangeSet),
    /// The snapshot is still open; dispose it or retry after resolving.
    Failure(ApplyConflict),
}

#[derive(Debug)]
pub struct ApplyConflict {
    pub snapshot: Snapshot,
    pub cells: Vec<CellId>,
}

impl ApplyResult {
    pub fn succeeded(&self) -> bool {
        matches!(self, ApplyResult::Success(_))
    }

    /// Converts a failure into [`StateError::ApplyConflict`], disposing the
    /// conflicting snapshot.
    pub fn check(self) -> Result<ChangeSet, StateError> {
        match self {
            ApplyResult::Success(changes) => Ok(changes),
            ApplyResult::Failure(conflict) => {
                let snapshot = conflict.snapshot.id();
                conflict.snapshot.dispose();
                Err(StateError::ApplyConflict {
                    snapshot,
                    cells: conflict.cells,
                })
            }
        }
    }
}
