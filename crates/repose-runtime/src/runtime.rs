use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use repose_snapshot::{CellId, DerivedState, ObserverStack, Snapshot, StateCell};

use crate::composition::CompositionState;
use crate::effects::{EffectSlot, QueuedEffect};
use crate::scope::{Body, SavedScope, ScopeRecord, Slot};
use crate::{ComposeError, Container, Dispose, Key, NodeId, ScopeFlags, ScopeId, SlotKey};

/// Everything one drain staged, committed only if the whole batch succeeds.
pub(crate) struct Batch<N> {
    /// Scopes in execution order.
    pub order: Vec<ScopeId>,
    pub composed: HashSet<ScopeId>,
    pub created: Vec<ScopeId>,
    pub removed: Vec<ScopeId>,
    pub removed_set: HashSet<ScopeId>,
    pub saved: HashMap<ScopeId, SavedScope<N>>,
    pub reads: Vec<(ScopeId, HashSet<CellId>)>,
    /// Containers whose children may have changed, with their depth.
    pub dirty: HashMap<Container, usize>,
    /// Handles of effects replaced or dropped by re-execution.
    pub unmounts: Vec<(ScopeId, Dispose)>,
    pub effects: Vec<QueuedEffect>,
}

impl<N> Default for Batch<N> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            composed: HashSet::new(),
            created: Vec::new(),
            removed: Vec::new(),
            removed_set: HashSet::new(),
            saved: HashMap::new(),
            reads: Vec::new(),
            dirty: HashMap::new(),
            unmounts: Vec::new(),
            effects: Vec::new(),
        }
    }
}

struct Frame<N> {
    scope: ScopeId,
    depth: usize,
    container: Container,
    container_depth: usize,
    old_slots: Vec<Slot<N>>,
    old_index: HashMap<SlotKey, usize>,
    slots: Vec<Slot<N>>,
    occurrences: HashMap<Key, u32>,
    remember_cursor: usize,
    old_effects: Vec<EffectSlot>,
    effects: Vec<EffectSlot>,
    /// `effects[i]` was carried over unchanged from `old_effects[i]`.
    carried: Vec<bool>,
}

/// Handle given to composable bodies while they execute.
///
/// Reads through [`Composer::read`] subscribe the executing scope to the cell;
/// nodes and child scopes are emitted in call order and identified by key.
pub struct Composer<'a, N> {
    pub(crate) state: &'a mut CompositionState<N>,
    pub(crate) batch: &'a mut Batch<N>,
    snapshot: &'a Snapshot,
    observers: &'a mut ObserverStack,
    reads: Rc<RefCell<Vec<HashSet<CellId>>>>,
    frames: Vec<Frame<N>>,
}

impl<'a, N: Clone + PartialEq + 'static> Composer<'a, N> {
    pub(crate) fn new(
        state: &'a mut CompositionState<N>,
        batch: &'a mut Batch<N>,
        snapshot: &'a Snapshot,
        observers: &'a mut ObserverStack,
        reads: Rc<RefCell<Vec<HashSet<CellId>>>>,
    ) -> Self {
        Self {
            state,
            batch,
            snapshot,
            observers,
            reads,
            frames: Vec::new(),
        }
    }

    /// The batch snapshot all reads and writes of this drain go through.
    pub fn snapshot(&self) -> &Snapshot {
        self.snapshot
    }

    pub fn observers(&mut self) -> &mut ObserverStack {
        self.observers
    }

    /// Scope whose body is executing.
    pub fn current_scope(&self) -> ScopeId {
        self.frames.last().map(|f| f.scope).unwrap_or_default()
    }

    /// Reads `cell` and subscribes the current scope to it.
    pub fn read<T: Clone + Send + Sync + 'static>(
        &mut self,
        cell: &StateCell<T>,
    ) -> Result<T, ComposeError> {
        Ok(cell.get(self.snapshot, self.observers)?)
    }

    pub fn read_with<T: Clone + Send + Sync + 'static, R>(
        &mut self,
        cell: &StateCell<T>,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, ComposeError> {
        Ok(cell.with(self.snapshot, self.observers, f)?)
    }

    /// Reads derived state; the current scope subscribes to its dependencies.
    pub fn read_derived<T: Clone + Send + Sync + 'static>(
        &mut self,
        derived: &DerivedState<T>,
    ) -> Result<T, ComposeError> {
        Ok(derived.get(self.snapshot, self.observers)?)
    }

    pub fn write<T: Clone + Send + Sync + 'static>(
        &mut self,
        cell: &StateCell<T>,
        value: T,
    ) -> Result<(), ComposeError> {
        Ok(cell.set(self.snapshot, self.observers, value)?)
    }

    pub fn update<T: Clone + Send + Sync + 'static>(
        &mut self,
        cell: &StateCell<T>,
        f: impl FnOnce(&mut T),
    ) -> Result<(), ComposeError> {
        Ok(cell.update(self.snapshot, self.observers, f)?)
    }

    /// Emits a leaf node.
    pub fn emit(&mut self, key: impl Into<Key>, node: N) {
        let slot = self.next_slot(key.into());
        self.push_slot(Slot::Node {
            slot,
            node,
            content: None,
        });
    }

    /// Emits a node whose children are produced by `content`, a scope of its
    /// own that recomposes independently.
    pub fn emit_with_content(
        &mut self,
        key: impl Into<Key>,
        node: N,
        content: impl FnMut(&mut Composer<'_, N>) -> Result<(), ComposeError> + 'static,
    ) -> Result<ScopeId, ComposeError> {
        let slot = self.next_slot(key.into());
        let Some((_, container_depth)) = self.frame_container() else {
            return Err(ComposeError::msg("emit_with_content called outside a scope"));
        };
        let container = Container::Node(NodeId {
            scope: self.current_scope(),
            slot,
        });
        let reuse = match self.previous_slot(slot) {
            Some(Slot::Node {
                content: Some(id), ..
            }) => Some(*id),
            _ => None,
        };
        let body: Body<N> = Rc::new(RefCell::new(content));
        let id = self.child_scope(slot, container, container_depth + 1, reuse, body);
        self.push_slot(Slot::Node {
            slot,
            node,
            content: Some(id),
        });
        self.execute(id)?;
        Ok(id)
    }

    /// Runs `body` as a child scope. It re-executes with its parent, and on
    /// its own when a cell it read changes.
    pub fn scope(
        &mut self,
        key: impl Into<Key>,
        body: impl FnMut(&mut Composer<'_, N>) -> Result<(), ComposeError> + 'static,
    ) -> Result<ScopeId, ComposeError> {
        let slot = self.next_slot(key.into());
        let id = self.child_for(slot, Rc::new(RefCell::new(body)))?;
        self.execute(id)?;
        Ok(id)
    }

    /// Like [`scope`](Self::scope), but a parent re-execution skips it when
    /// `inputs` equal the ones it last ran with.
    pub fn skippable<I: PartialEq + 'static>(
        &mut self,
        key: impl Into<Key>,
        inputs: I,
        body: impl FnMut(&mut Composer<'_, N>) -> Result<(), ComposeError> + 'static,
    ) -> Result<ScopeId, ComposeError> {
        let slot = self.next_slot(key.into());
        let previous = match self.previous_slot(slot) {
            Some(Slot::Scope { id, .. }) => Some(*id),
            _ => None,
        };
        if let Some(id) = previous
            && let Some(record) = self.state.scopes.get(id)
            && record
                .inputs
                .as_ref()
                .and_then(|old| old.downcast_ref::<I>())
                .is_some_and(|old| *old == inputs)
        {
            log::trace!("skipping scope {:?}", id);
            self.push_slot(Slot::Scope { slot, id });
            return Ok(id);
        }

        let id = self.child_for(slot, Rc::new(RefCell::new(body)))?;
        if let Some(record) = self.state.scopes.get_mut(id) {
            record.inputs = Some(Rc::new(inputs));
            record.flags.insert(ScopeFlags::SKIPPABLE);
        }
        self.execute(id)?;
        Ok(id)
    }

    fn child_for(&mut self, slot: SlotKey, body: Body<N>) -> Result<ScopeId, ComposeError> {
        let Some((container, container_depth)) = self.frame_container() else {
            return Err(ComposeError::msg("child scope created outside a scope"));
        };
        let reuse = match self.previous_slot(slot) {
            Some(Slot::Scope { id, .. }) => Some(*id),
            _ => None,
        };
        let id = self.child_scope(slot, container, container_depth, reuse, body);
        self.push_slot(Slot::Scope { slot, id });
        Ok(id)
    }

    fn child_scope(
        &mut self,
        slot: SlotKey,
        container: Container,
        container_depth: usize,
        reuse: Option<ScopeId>,
        body: Body<N>,
    ) -> ScopeId {
        if let Some(id) = reuse.filter(|id| self.state.scopes.contains_key(*id)) {
            self.save(id);
            if let Some(record) = self.state.scopes.get_mut(id) {
                record.body = Some(body);
            }
            return id;
        }
        let parent = self.frames.last().map(|f| (f.scope, f.depth));
        let record = ScopeRecord::new(
            slot,
            parent.map(|(id, _)| id),
            parent.map_or(0, |(_, depth)| depth + 1),
            container,
            container_depth,
            body,
        );
        let id = self.state.scopes.insert(record);
        if let Container::Node(_) = container {
            self.state.owners.insert(container, id);
        }
        self.batch.created.push(id);
        id
    }

    /// Slot-based remember. The Nth call in a scope always refers to the Nth
    /// stored value.
    pub fn remember<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Rc<T> {
        let Some(frame) = self.frames.last_mut() else {
            return Rc::new(init());
        };
        let cursor = frame.remember_cursor;
        frame.remember_cursor += 1;
        let scope = frame.scope;
        let Some(record) = self.state.scopes.get_mut(scope) else {
            return Rc::new(init());
        };

        if let Some(existing) = record.remembered.get(cursor) {
            if let Ok(rc) = existing.clone().downcast::<T>() {
                return rc;
            }
            log::warn!(
                "remember: slot {} of scope {:?} type changed; replacing. \
                 If this is due to conditional composition, prefer remember_with_key.",
                cursor,
                scope
            );
            let rc: Rc<T> = Rc::new(init());
            record.remembered[cursor] = rc.clone() as Rc<dyn std::any::Any>;
            return rc;
        }

        let rc: Rc<T> = Rc::new(init());
        record.remembered.push(rc.clone());
        rc
    }

    /// Key-based remember, stable across conditional branches.
    pub fn remember_with_key<T: 'static>(
        &mut self,
        key: impl Into<Key>,
        init: impl FnOnce() -> T,
    ) -> Rc<T> {
        let key = key.into();
        let scope = self.current_scope();
        let Some(record) = self.state.scopes.get_mut(scope) else {
            return Rc::new(init());
        };

        if let Some(existing) = record.keyed.get(&key) {
            if let Ok(rc) = existing.clone().downcast::<T>() {
                return rc;
            }
            log::warn!(
                "remember_with_key: key {:?} reused with a different type; replacing.",
                key
            );
        }

        let rc: Rc<T> = Rc::new(init());
        record.keyed.insert(key, rc.clone());
        rc
    }

    pub fn remember_state<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Rc<RefCell<T>> {
        self.remember(|| RefCell::new(init()))
    }

    pub fn remember_state_with_key<T: 'static>(
        &mut self,
        key: impl Into<Key>,
        init: impl FnOnce() -> T,
    ) -> Rc<RefCell<T>> {
        self.remember_with_key(key, || RefCell::new(init()))
    }

    /// Remembered state cell, created in the batch snapshot on first use.
    pub fn remember_cell<T: Clone + PartialEq + Send + Sync + 'static>(
        &mut self,
        init: impl FnOnce() -> T,
    ) -> Result<StateCell<T>, ComposeError> {
        let slot = self.remember(|| RefCell::new(None::<StateCell<T>>));
        if let Some(cell) = slot.borrow().as_ref() {
            return Ok(cell.clone());
        }
        let cell = StateCell::new(self.snapshot, init())?;
        *slot.borrow_mut() = Some(cell.clone());
        Ok(cell)
    }

    fn next_slot(&mut self, key: Key) -> SlotKey {
        let Some(frame) = self.frames.last_mut() else {
            return SlotKey { key, occurrence: 0 };
        };
        let occurrence = frame.occurrences.entry(key).or_insert(0);
        let slot = SlotKey {
            key,
            occurrence: *occurrence,
        };
        *occurrence += 1;
        slot
    }

    fn previous_slot(&self, slot: SlotKey) -> Option<&Slot<N>> {
        let frame = self.frames.last()?;
        frame.old_index.get(&slot).map(|&i| &frame.old_slots[i])
    }

    fn push_slot(&mut self, slot: Slot<N>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.slots.push(slot);
        }
    }

    fn frame_container(&self) -> Option<(Container, usize)> {
        self.frames
            .last()
            .map(|f| (f.container, f.container_depth))
    }

    pub(crate) fn previous_effect(&self) -> Option<&EffectSlot> {
        let frame = self.frames.last()?;
        frame.old_effects.get(frame.effects.len())
    }

    pub(crate) fn keep_previous_effect(&mut self) {
        if let Some(frame) = self.frames.last_mut()
            && let Some(previous) = frame.old_effects.get(frame.effects.len()).cloned()
        {
            frame.effects.push(previous);
            frame.carried.push(true);
        }
    }

    pub(crate) fn push_effect(&mut self, slot: EffectSlot) -> Option<usize> {
        let frame = self.frames.last_mut()?;
        frame.effects.push(slot);
        frame.carried.push(false);
        Some(frame.effects.len() - 1)
    }

    fn save(&mut self, id: ScopeId) {
        if self.batch.saved.contains_key(&id) || self.batch.created.contains(&id) {
            return;
        }
        if let Some(record) = self.state.scopes.get(id) {
            self.batch.saved.insert(id, SavedScope::capture(record));
        }
    }

    /// Runs the body of `id` and stages what it emitted.
    pub(crate) fn execute(&mut self, id: ScopeId) -> Result<(), ComposeError> {
        self.save(id);
        let Some(record) = self.state.scopes.get_mut(id) else {
            return Err(ComposeError::Disposed);
        };
        let Some(body) = record.body.clone() else {
            return Err(ComposeError::MissingBody(id));
        };
        record.flags.remove(ScopeFlags::VALID | ScopeFlags::INVALID);
        record.flags.insert(ScopeFlags::COMPOSING);
        record.recompositions += 1;
        log::trace!("composing scope {:?} (depth {})", id, record.depth);

        let old_slots = std::mem::take(&mut record.slots);
        let old_index = old_slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key(), i))
            .collect();
        let frame = Frame {
            scope: id,
            depth: record.depth,
            container: record.container,
            container_depth: record.container_depth,
            old_slots,
            old_index,
            slots: Vec::new(),
            occurrences: HashMap::new(),
            remember_cursor: 0,
            old_effects: std::mem::take(&mut record.effects),
            effects: Vec::new(),
            carried: Vec::new(),
        };
        self.batch.order.push(id);
        self.batch.composed.insert(id);
        self.batch.dirty.insert(frame.container, frame.container_depth);

        self.frames.push(frame);
        self.reads.borrow_mut().push(HashSet::new());
        let result = {
            let mut body = body.borrow_mut();
            (&mut *body)(self)
        };
        let reads = self.reads.borrow_mut().pop().unwrap_or_default();
        let Some(frame) = self.frames.pop() else {
            return Err(ComposeError::msg("composer frame stack underflow"));
        };
        result?;
        self.finish(frame, reads);
        Ok(())
    }

    fn finish(&mut self, frame: Frame<N>, reads: HashSet<CellId>) {
        let Frame {
            scope,
            old_slots,
            slots,
            remember_cursor,
            old_effects,
            effects,
            carried,
            ..
        } = frame;

        let kept: HashSet<ScopeId> = slots.iter().filter_map(Slot::child).collect();
        for old in &old_slots {
            if let Some(child) = old.child()
                && !kept.contains(&child)
                && self.batch.removed_set.insert(child)
            {
                self.batch.removed.push(child);
            }
        }
        for (i, old) in old_effects.into_iter().enumerate() {
            if carried.get(i).copied() != Some(true)
                && let Some(handle) = old.handle
            {
                self.batch.unmounts.push((scope, handle));
            }
        }

        if let Some(record) = self.state.scopes.get_mut(scope) {
            record.slots = slots;
            record.effects = effects;
            record.remembered.truncate(remember_cursor);
            record.flags.remove(ScopeFlags::COMPOSING);
            record.flags.insert(ScopeFlags::VALID);
        }
        self.batch.reads.push((scope, reads));
    }
}
