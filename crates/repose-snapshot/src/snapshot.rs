use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::id::SnapshotIdSet;
use crate::state::{MergeOutcome, MergedValue};
use crate::store::{Registry, notify_apply};
use crate::{ApplyConflict, ApplyResult, CellId, ChangeSet, SnapshotId, SnapshotStore, StateError, StateRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    /// The implicit, always-open snapshot over the latest global state.
    Global,
    ReadOnly,
    Mutable,
    NestedReadOnly,
    NestedMutable,
}

impl SnapshotKind {
    pub fn is_read_only(self) -> bool {
        matches!(self, SnapshotKind::ReadOnly | SnapshotKind::NestedReadOnly)
    }

    pub fn is_nested(self) -> bool {
        matches!(self, SnapshotKind::NestedReadOnly | SnapshotKind::NestedMutable)
    }
}

pub(crate) struct SnapshotState {
    id: SnapshotId,
    invalid: Arc<SnapshotIdSet>,
    modified: BTreeMap<CellId, StateRef>,
    /// Ids this snapshot used before advancing. They stay open with it.
    previous_ids: SnapshotIdSet,
    pins: SmallVec<[SnapshotId; 2]>,
    /// Nested read-only snapshots of read-only snapshots share their parent's id.
    owns_id: bool,
    applied: bool,
    disposed: bool,
    nested: usize,
}

impl SnapshotState {
    fn new(id: SnapshotId, invalid: SnapshotIdSet, pin: Option<SnapshotId>) -> Self {
        Self {
            id,
            invalid: Arc::new(invalid),
            modified: BTreeMap::new(),
            previous_ids: SnapshotIdSet::new(),
            pins: pin.into_iter().collect(),
            owns_id: pin.is_some(),
            applied: false,
            disposed: false,
            nested: 0,
        }
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.applied || self.disposed {
            Err(StateError::SnapshotClosed { snapshot: self.id })
        } else {
            Ok(())
        }
    }

    fn ensure_applicable(&self) -> Result<(), StateError> {
        if self.applied {
            Err(StateError::AlreadyApplied { snapshot: self.id })
        } else if self.disposed {
            Err(StateError::SnapshotClosed { snapshot: self.id })
        } else {
            Ok(())
        }
    }

    /// Moves to a fresh id so later writes land in new records. Everything
    /// allocated between the old and the new id stays invisible.
    fn advance(&mut self, registry: &mut Registry) {
        self.previous_ids.insert(self.id);
        let id = registry.allocate();
        registry.open.insert(id);
        Arc::make_mut(&mut self.invalid).add_range(self.id + 1, id);
        self.id = id;
    }
}

struct SnapshotInner {
    store: SnapshotStore,
    kind: SnapshotKind,
    parent: Option<Snapshot>,
    state: Mutex<SnapshotState>,
}

/// A consistent view of every state cell.
///
/// Handles are cheap to clone and share one underlying snapshot. Dropping the
/// last handle of an open snapshot disposes it.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

enum Resolution {
    Clean {
        merges: Vec<(StateRef, SnapshotId, MergedValue)>,
        reverted: Vec<CellId>,
    },
    Conflict(Vec<CellId>),
}

impl Snapshot {
    pub(crate) fn global(store: SnapshotStore) -> Self {
        Self::from_parts(
            store,
            SnapshotKind::Global,
            None,
            SnapshotState::new(crate::INVALID_SNAPSHOT, SnapshotIdSet::new(), None),
        )
    }

    pub(crate) fn root(
        store: SnapshotStore,
        kind: SnapshotKind,
        id: SnapshotId,
        invalid: SnapshotIdSet,
        pin: SnapshotId,
    ) -> Self {
        Self::from_parts(store, kind, None, SnapshotState::new(id, invalid, Some(pin)))
    }

    fn from_parts(
        store: SnapshotStore,
        kind: SnapshotKind,
        parent: Option<Snapshot>,
        state: SnapshotState,
    ) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                store,
                kind,
                parent,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> SnapshotId {
        match self.inner.kind {
            SnapshotKind::Global => self.inner.store.current_global_id(),
            _ => self.inner.state.lock().id,
        }
    }

    pub fn kind(&self) -> SnapshotKind {
        self.inner.kind
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.inner.store
    }

    pub fn parent(&self) -> Option<&Snapshot> {
        self.inner.parent.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.kind.is_read_only()
    }

    pub fn is_open(&self) -> bool {
        match self.inner.kind {
            SnapshotKind::Global => true,
            _ => self.inner.state.lock().ensure_open().is_ok(),
        }
    }

    pub fn is_applied(&self) -> bool {
        self.inner.state.lock().applied
    }

    pub fn has_pending_changes(&self) -> bool {
        match self.inner.kind {
            SnapshotKind::Global => !self.registry().global.modified.is_empty(),
            _ => !self.inner.state.lock().modified.is_empty(),
        }
    }

    /// Ids of the cells written in this snapshot so far.
    pub fn modified_cells(&self) -> Vec<CellId> {
        match self.inner.kind {
            SnapshotKind::Global => self.registry().global.modified.keys().copied().collect(),
            _ => self.inner.state.lock().modified.keys().copied().collect(),
        }
    }

    /// Number of nested mutable snapshots currently open in this one.
    pub fn nested_count(&self) -> usize {
        self.inner.state.lock().nested
    }

    pub fn is_same(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.store.inner.registry.lock()
    }

    /// Id and invalid set that reads through this snapshot resolve against.
    pub(crate) fn view(&self) -> Result<(SnapshotId, Arc<SnapshotIdSet>), StateError> {
        match self.inner.kind {
            SnapshotKind::Global => {
                let registry = self.registry();
                Ok((registry.global.id, registry.global.invalid.clone()))
            }
            _ => {
                let state = self.inner.state.lock();
                state.ensure_open()?;
                Ok((state.id, state.invalid.clone()))
            }
        }
    }

    /// Runs `write` with the id to write under, the invalid set and the reuse
    /// limit, then records `state` as modified.
    pub(crate) fn record_write(
        &self,
        state: &StateRef,
        write: impl FnOnce(SnapshotId, &SnapshotIdSet, SnapshotId) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        let mut registry = self.registry();
        let reuse_limit = registry.reuse_limit();
        if self.inner.kind == SnapshotKind::Global {
            let id = registry.global.id;
            let invalid = registry.global.invalid.clone();
            write(id, &invalid, reuse_limit)?;
            registry.global.modified.insert(state.cell_id(), state.clone());
            let observers = registry.write_observers();
            drop(registry);
            for observer in observers {
                observer(state);
            }
            return Ok(());
        }

        let mut snapshot = self.inner.state.lock();
        snapshot.ensure_open()?;
        if self.inner.kind.is_read_only() {
            return Err(StateError::ReadOnlyWrite {
                snapshot: snapshot.id,
            });
        }
        write(snapshot.id, &snapshot.invalid, reuse_limit)?;
        snapshot.modified.insert(state.cell_id(), state.clone());
        Ok(())
    }

    /// Opens a read-only snapshot of this snapshot's current view.
    pub fn take_nested_snapshot(&self) -> Result<Snapshot, StateError> {
        match self.inner.kind {
            SnapshotKind::Global => Ok(self.inner.store.open_root(SnapshotKind::ReadOnly)),
            SnapshotKind::ReadOnly | SnapshotKind::NestedReadOnly => {
                let state = self.inner.state.lock();
                state.ensure_open()?;
                let mut nested = SnapshotState::new(state.id, SnapshotIdSet::new(), None);
                nested.invalid = state.invalid.clone();
                Ok(Self::from_parts(
                    self.inner.store.clone(),
                    SnapshotKind::NestedReadOnly,
                    Some(self.clone()),
                    nested,
                ))
            }
            SnapshotKind::Mutable | SnapshotKind::NestedMutable => {
                self.nest(SnapshotKind::NestedReadOnly)
            }
        }
    }

    /// Opens a mutable snapshot whose writes apply into this one.
    pub fn take_nested_mutable_snapshot(&self) -> Result<Snapshot, StateError> {
        match self.inner.kind {
            SnapshotKind::Global => Ok(self.inner.store.open_root(SnapshotKind::Mutable)),
            SnapshotKind::ReadOnly | SnapshotKind::NestedReadOnly => {
                Err(StateError::ReadOnlyWrite { snapshot: self.id() })
            }
            SnapshotKind::Mutable | SnapshotKind::NestedMutable => {
                self.nest(SnapshotKind::NestedMutable)
            }
        }
    }

    fn nest(&self, kind: SnapshotKind) -> Result<Snapshot, StateError> {
        let mut registry = self.registry();
        let mut parent = self.inner.state.lock();
        parent.ensure_open()?;

        let id = registry.allocate();
        registry.open.insert(id);
        let mut invalid = (*parent.invalid).clone();
        invalid.add_range(parent.id + 1, id);
        let pin = registry.pin(invalid.lowest_or(id));

        Arc::make_mut(&mut parent.invalid).insert(id);
        if kind == SnapshotKind::NestedMutable {
            parent.nested += 1;
        }
        // Later parent writes must not leak into the child.
        parent.advance(&mut registry);

        log::trace!("opened {:?} snapshot {} in {}", kind, id, parent.id);
        Ok(Self::from_parts(
            self.inner.store.clone(),
            kind,
            Some(self.clone()),
            SnapshotState::new(id, invalid, Some(pin)),
        ))
    }

    /// Makes this snapshot's writes visible to its parent, or to the global
    /// state for a root snapshot.
    ///
    /// A conflict leaves the snapshot open and returns
    /// [`ApplyResult::Failure`]; errors are reserved for misuse.
    pub fn apply(&self) -> Result<ApplyResult, StateError> {
        match self.inner.kind {
            SnapshotKind::Global => Err(StateError::GlobalApply),
            SnapshotKind::ReadOnly | SnapshotKind::NestedReadOnly => {
                Err(StateError::ReadOnlyWrite { snapshot: self.id() })
            }
            SnapshotKind::Mutable => self.apply_root(),
            SnapshotKind::NestedMutable => self.apply_nested(),
        }
    }

    fn apply_root(&self) -> Result<ApplyResult, StateError> {
        let store = self.inner.store.clone();
        let mut registry = store.inner.registry.lock();
        let mut state = self.inner.state.lock();
        state.ensure_applicable()?;

        let changes = if state.modified.is_empty() {
            ChangeSet::default()
        } else {
            let mut current_invalid = registry.open.clone();
            current_invalid.remove(registry.global.id);
            match resolve(&state, registry.peek_next(), &current_invalid)? {
                Resolution::Conflict(cells) => {
                    log::debug!("snapshot {} conflicts on cells {:?}", state.id, cells);
                    return Ok(ApplyResult::Failure(ApplyConflict {
                        snapshot: self.clone(),
                        cells,
                    }));
                }
                Resolution::Clean { merges, reverted } => {
                    commit(merges);
                    for cell in reverted {
                        state.modified.remove(&cell);
                    }
                }
            }
            ChangeSet::new(std::mem::take(&mut state.modified))
        };

        let previous_ids = std::mem::take(&mut state.previous_ids);
        registry.close(state.id, &previous_ids);
        let global_changes = registry.advance_global();
        state.applied = true;
        for pin in state.pins.drain(..) {
            registry.unpin(pin);
        }
        let id = state.id;
        let observers = registry.apply_observers();
        drop(state);
        drop(registry);

        if let Some((global, global_id)) = global_changes {
            notify_apply(&observers, &global, global_id);
        }
        if !changes.is_empty() {
            notify_apply(&observers, &changes, id);
        }
        log::trace!("applied snapshot {} ({} cells)", id, changes.len());
        Ok(ApplyResult::Success(changes))
    }

    fn apply_nested(&self) -> Result<ApplyResult, StateError> {
        let Some(parent) = self.inner.parent.as_ref() else {
            return Err(StateError::ParentClosed { snapshot: self.id() });
        };
        let store = self.inner.store.clone();
        let mut registry = store.inner.registry.lock();
        let mut parent_state = parent.inner.state.lock();
        let mut state = self.inner.state.lock();
        state.ensure_applicable()?;
        if parent_state.ensure_open().is_err() {
            return Err(StateError::ParentClosed { snapshot: state.id });
        }

        let changes = if state.modified.is_empty() {
            let previous_ids = std::mem::take(&mut state.previous_ids);
            registry.close(state.id, &previous_ids);
            for pin in state.pins.drain(..) {
                registry.unpin(pin);
            }
            ChangeSet::default()
        } else {
            match resolve(&state, parent_state.id, &parent_state.invalid)? {
                Resolution::Conflict(cells) => {
                    log::debug!("nested snapshot {} conflicts on cells {:?}", state.id, cells);
                    return Ok(ApplyResult::Failure(ApplyConflict {
                        snapshot: self.clone(),
                        cells,
                    }));
                }
                Resolution::Clean { merges, reverted } => {
                    commit(merges);
                    for cell in reverted {
                        state.modified.remove(&cell);
                    }
                }
            }
            for (cell, object) in &state.modified {
                parent_state.modified.insert(*cell, object.clone());
            }
            // The child's records stay visible only through the parent now,
            // so the parent keeps them pinned until it closes.
            let pins: SmallVec<[SnapshotId; 2]> = state.pins.drain(..).collect();
            parent_state.pins.extend(pins);
            ChangeSet::new(std::mem::take(&mut state.modified))
        };

        if parent_state.id < state.id {
            parent_state.advance(&mut registry);
        }
        let child_id = state.id;
        let child_previous = state.previous_ids.clone();
        let parent_invalid = Arc::make_mut(&mut parent_state.invalid);
        parent_invalid.remove(child_id);
        parent_invalid.difference_with(&child_previous);
        parent_state.previous_ids.insert(child_id);
        parent_state.previous_ids.union_with(&child_previous);
        parent_state.nested = parent_state.nested.saturating_sub(1);
        state.applied = true;

        log::trace!(
            "applied nested snapshot {} into {} ({} cells)",
            child_id,
            parent_state.id,
            changes.len()
        );
        Ok(ApplyResult::Success(changes))
    }

    /// Releases the snapshot. Unapplied writes are abandoned. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl SnapshotInner {
    fn dispose(&self) {
        if self.kind == SnapshotKind::Global {
            return;
        }
        let mut registry = self.store.inner.registry.lock();
        let mut parent_state = self
            .parent
            .as_ref()
            .filter(|_| self.kind == SnapshotKind::NestedMutable)
            .map(|parent| parent.inner.state.lock());
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;

        if !state.applied {
            if !state.modified.is_empty() {
                let mut owned = state.previous_ids.clone();
                owned.insert(state.id);
                for object in state.modified.values() {
                    object.abandon(&owned);
                }
                log::trace!(
                    "abandoned {} writes of snapshot {}",
                    state.modified.len(),
                    state.id
                );
                state.modified.clear();
            }
            if state.owns_id {
                let previous_ids = std::mem::take(&mut state.previous_ids);
                registry.close(state.id, &previous_ids);
            }
            if let Some(parent) = parent_state.as_mut() {
                parent.nested = parent.nested.saturating_sub(1);
            }
        }
        for pin in state.pins.drain(..) {
            registry.unpin(pin);
        }
    }
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn resolve(
    state: &SnapshotState,
    current_id: SnapshotId,
    current_invalid: &SnapshotIdSet,
) -> Result<Resolution, StateError> {
    let mut start = (*state.invalid).clone();
    start.insert(state.id);
    start.union_with(&state.previous_ids);

    let mut merges = Vec::new();
    let mut reverted = Vec::new();
    let mut conflicts = Vec::new();
    for (cell, object) in &state.modified {
        let Some(current) = object.readable_id(current_id, current_invalid) else {
            continue;
        };
        // Cells created in this snapshot have nothing to collide with.
        let Some(previous) = object.readable_id(state.id, &start) else {
            continue;
        };
        if current == previous {
            continue;
        }
        let applied = object
            .readable_id(state.id, &state.invalid)
            .ok_or(StateError::NoReadableRecord {
                cell: *cell,
                snapshot: state.id,
            })?;
        match object.merge_records(previous, current, applied) {
            MergeOutcome::Conflict => conflicts.push(*cell),
            MergeOutcome::KeepApplied => {}
            MergeOutcome::Merged(value) => merges.push((object.clone(), applied, value)),
            MergeOutcome::Reverted(value) => {
                merges.push((object.clone(), applied, value));
                reverted.push(*cell);
            }
        }
    }

    if conflicts.is_empty() {
        Ok(Resolution::Clean { merges, reverted })
    } else {
        Ok(Resolution::Conflict(conflicts))
    }
}

fn commit(merges: Vec<(StateRef, SnapshotId, MergedValue)>) {
    for (object, applied, value) in merges {
        object.commit_merge(applied, value);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id())
            .field("kind", &self.inner.kind)
            .finish()
    }
}
