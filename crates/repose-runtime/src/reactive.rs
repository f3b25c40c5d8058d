use std::collections::{BTreeSet, HashMap, HashSet};

use repose_snapshot::CellId;

use crate::ScopeId;

/// Which scopes read which cells during their last execution.
#[derive(Default)]
pub(crate) struct DepGraph {
    // cell -> scopes that read it
    edges: HashMap<CellId, HashSet<ScopeId>>,
    // scope -> cells it read
    back: HashMap<ScopeId, HashSet<CellId>>,
}

impl DepGraph {
    fn remove_all_edges_for(&mut self, scope: ScopeId) {
        if let Some(cells) = self.back.remove(&scope) {
            for cell in cells {
                if let Some(set) = self.edges.get_mut(&cell) {
                    set.remove(&scope);
                    if set.is_empty() {
                        self.edges.remove(&cell);
                    }
                }
            }
        }
    }

    /// Replaces the read set of `scope`.
    pub fn record(&mut self, scope: ScopeId, reads: HashSet<CellId>) {
        self.remove_all_edges_for(scope);
        for &cell in &reads {
            self.edges.entry(cell).or_default().insert(scope);
        }
        if !reads.is_empty() {
            self.back.insert(scope, reads);
        }
    }

    pub fn remove_scope(&mut self, scope: ScopeId) {
        self.remove_all_edges_for(scope);
    }

    /// Scopes that read any of `cells`, deduplicated, in key order.
    pub fn dependents<'a>(&self, cells: impl IntoIterator<Item = &'a CellId>) -> Vec<ScopeId> {
        let mut out = BTreeSet::new();
        for cell in cells {
            if let Some(scopes) = self.edges.get(cell) {
                out.extend(scopes.iter().copied());
            }
        }
        out.into_iter().collect()
    }

    pub fn reads_of(&self, scope: ScopeId) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self
            .back
            .get(&scope)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        cells.sort_unstable();
        cells
    }

    pub fn tracked_scopes(&self) -> usize {
        self.back.len()
    }

    pub fn clear(&mut self) {
        self.edges.clear();
        self.back.clear();
    }
}
