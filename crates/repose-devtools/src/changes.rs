//! Recent state changes, for debugging why a scope recomposed.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use repose_snapshot::{CellId, ObserverHandle, SnapshotId, SnapshotStore};
use web_time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// A snapshot applied, or global writes were sent.
    Apply(SnapshotId),
    /// A write in the global snapshot, not yet sent.
    GlobalWrite,
}

#[derive(Clone, Debug)]
pub struct ChangeEntry {
    pub at: Instant,
    pub kind: ChangeKind,
    pub cells: Vec<CellId>,
}

/// Bounded log of applies and global writes on a store. Stops listening when
/// dropped.
pub struct ChangeLog {
    entries: Arc<Mutex<VecDeque<ChangeEntry>>>,
    handles: Vec<ObserverHandle>,
}

impl ChangeLog {
    pub fn attach(store: &SnapshotStore, capacity: usize) -> Self {
        let entries = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let push = {
            let entries = entries.clone();
            move |entry: ChangeEntry| {
                let mut entries = entries.lock();
                if entries.len() == capacity {
                    entries.pop_front();
                }
                if capacity > 0 {
                    entries.push_back(entry);
                }
            }
        };

        let on_apply = push.clone();
        let apply = store.register_apply_observer(move |changes, snapshot| {
            log::trace!("apply {}: {:?}", snapshot, changes);
            on_apply(ChangeEntry {
                at: Instant::now(),
                kind: ChangeKind::Apply(snapshot),
                cells: changes.ids().collect(),
            });
        });
        let write = store.register_global_write_observer(move |state| {
            push(ChangeEntry {
                at: Instant::now(),
                kind: ChangeKind::GlobalWrite,
                cells: vec![state.cell_id()],
            });
        });

        Self {
            entries,
            handles: vec![apply, write],
        }
    }

    pub fn entries(&self) -> Vec<ChangeEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Applies that touched `cell`, oldest first.
    pub fn applies_touching(&self, cell: CellId) -> Vec<SnapshotId> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry.kind {
                ChangeKind::Apply(id) if entry.cells.contains(&cell) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Drop for ChangeLog {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.dispose();
        }
    }
}
