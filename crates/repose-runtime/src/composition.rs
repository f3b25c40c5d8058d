use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::Rc;

use repose_snapshot::{ApplyResult, CellId, ObserverStack, SnapshotStore, StateRef};
use slotmap::SlotMap;
use smallvec::SmallVec;
use web_time::Instant;

use crate::diff::{DiffOp, keyed_diff};
use crate::effects::QueuedEffect;
use crate::error::panic_message;
use crate::runtime::Batch;
use crate::scope::{Body, ScopeRecord, Slot};
use crate::{
    Applier, ComposeError, Composer, Container, Dispose, DrainReport, EffectFailure, Key, NodeId,
    Recomposer, ScopeFlags, ScopeId, ScopeState, SlotKey,
};

/// Committed child lists, as last sent to the applier.
pub(crate) struct Mirror<N> {
    children: HashMap<Container, Vec<(NodeId, N)>>,
    parents: HashMap<NodeId, Container>,
}

impl<N> Default for Mirror<N> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            parents: HashMap::new(),
        }
    }
}

impl<N: Clone + PartialEq> Mirror<N> {
    /// Child indices leading from the root to `container`, or `None` when the
    /// node owning it is not in the tree.
    fn path(&self, container: Container) -> Option<SmallVec<[usize; 8]>> {
        let mut path = SmallVec::new();
        let mut current = container;
        while let Container::Node(id) = current {
            let parent = *self.parents.get(&id)?;
            let index = self
                .children
                .get(&parent)?
                .iter()
                .position(|(node, _)| *node == id)?;
            path.push(index);
            current = parent;
        }
        path.reverse();
        Some(path)
    }

    fn forget(&mut self, container: Container) {
        if let Some(children) = self.children.remove(&container) {
            for (id, _) in children {
                self.parents.remove(&id);
                self.forget(Container::Node(id));
            }
        }
    }

    /// Brings `container` from its committed children to `new` through the
    /// applier. Returns the number of applier calls, navigation excluded.
    fn sync<A: Applier<N>>(
        &mut self,
        container: Container,
        path: &[usize],
        new: Vec<(NodeId, N)>,
        applier: &mut A,
    ) -> usize {
        let old = self.children.remove(&container).unwrap_or_default();
        let old_keys: Vec<NodeId> = old.iter().map(|(id, _)| *id).collect();
        let new_keys: Vec<NodeId> = new.iter().map(|(id, _)| *id).collect();
        let ops = keyed_diff(&old_keys, &new_keys);

        let previous: HashMap<NodeId, &N> = old.iter().map(|(id, node)| (*id, node)).collect();
        let updates: Vec<usize> = new
            .iter()
            .enumerate()
            .filter(|(_, (id, node))| previous.get(id).is_some_and(|old| *old != node))
            .map(|(i, _)| i)
            .collect();

        let mut replayed = 0;
        if !ops.is_empty() || !updates.is_empty() {
            for &index in path {
                applier.down(index);
            }
            for op in &ops {
                match *op {
                    DiffOp::Remove { index, count } => applier.remove(index, count),
                    DiffOp::Insert { index, source } => applier.insert(index, new[source].1.clone()),
                    DiffOp::Move { from, to } => applier.move_nodes(from, to, 1),
                }
            }
            let keeps_children = applier.update_keeps_children();
            for &index in &updates {
                applier.update(index, new[index].1.clone());
                if !keeps_children {
                    replayed += self.replay(new[index].0, index, applier);
                }
            }
            for _ in path {
                applier.up();
            }
        }

        let kept: HashSet<NodeId> = new_keys.iter().copied().collect();
        for id in old_keys {
            if !kept.contains(&id) {
                self.parents.remove(&id);
                self.forget(Container::Node(id));
            }
        }
        for id in new_keys {
            self.parents.insert(id, container);
        }
        self.children.insert(container, new);
        ops.len() + updates.len() + replayed
    }

    /// Inserts the committed children of `id`, which sits at `index` of the
    /// current container, and their subtrees. Returns the inserts made.
    fn replay<A: Applier<N>>(&self, id: NodeId, index: usize, applier: &mut A) -> usize {
        let Some(children) = self
            .children
            .get(&Container::Node(id))
            .filter(|children| !children.is_empty())
        else {
            return 0;
        };
        let mut inserted = 0;
        applier.down(index);
        for (i, (child, node)) in children.iter().enumerate() {
            applier.insert(i, node.clone());
            inserted += 1 + self.replay(*child, i, applier);
        }
        applier.up();
        inserted
    }

    fn clear(&mut self) {
        self.children.clear();
        self.parents.clear();
    }
}

/// Scope arena and node bookkeeping of one composition.
pub(crate) struct CompositionState<N> {
    pub scopes: SlotMap<ScopeId, ScopeRecord<N>>,
    /// Scope emitting the children of each node container.
    pub owners: HashMap<Container, ScopeId>,
    pub mirror: Mirror<N>,
    pub root: Option<ScopeId>,
}

impl<N> Default for CompositionState<N> {
    fn default() -> Self {
        Self {
            scopes: SlotMap::with_key(),
            owners: HashMap::new(),
            mirror: Mirror::default(),
            root: None,
        }
    }
}

impl<N: Clone> CompositionState<N> {
    /// `start` and every scope below it, parents before children, siblings in
    /// emission order.
    fn preorder_from(&self, start: ScopeId) -> Vec<ScopeId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let Some(record) = self.scopes.get(id) else {
                continue;
            };
            out.push(id);
            stack.extend(record.slots.iter().rev().filter_map(Slot::child));
        }
        out
    }

    /// Nodes a scope contributes to its container, child scopes inlined.
    fn flatten(&self, scope: ScopeId, out: &mut Vec<(NodeId, N)>) {
        let Some(record) = self.scopes.get(scope) else {
            return;
        };
        for slot in &record.slots {
            match slot {
                Slot::Node { slot, node, .. } => out.push((NodeId { scope, slot: *slot }, node.clone())),
                Slot::Scope { id, .. } => self.flatten(*id, out),
            }
        }
    }

    /// Committed dispose handles of `scopes`, in registration order.
    fn handles(&self, scopes: &[ScopeId]) -> Vec<(ScopeId, Dispose)> {
        scopes
            .iter()
            .filter_map(|&id| self.scopes.get(id).map(|record| (id, record)))
            .flat_map(|(id, record)| {
                record
                    .effects
                    .iter()
                    .filter_map(move |slot| slot.handle.clone().map(|handle| (id, handle)))
            })
            .collect()
    }

    fn detached(&self, scope: ScopeId, removed: &HashSet<ScopeId>) -> bool {
        let mut current = Some(scope);
        while let Some(id) = current {
            if removed.contains(&id) {
                return true;
            }
            current = self.scopes.get(id).and_then(|record| record.parent);
        }
        false
    }
}

/// A tree of recompose scopes driving an [`Applier`].
///
/// Single-threaded: bodies, remembered values and the applier live here. The
/// [`Recomposer`] it was created with is the thread-safe side.
pub struct Composition<N: Clone + PartialEq + 'static, A: Applier<N>> {
    pub(crate) recomposer: Recomposer,
    state: CompositionState<N>,
    applier: A,
    observers: ObserverStack,
    reads: Rc<RefCell<Vec<HashSet<CellId>>>>,
    disposed: bool,
}

impl<N: Clone + PartialEq + 'static, A: Applier<N>> Composition<N, A> {
    pub fn new(recomposer: &Recomposer, applier: A) -> Self {
        let reads: Rc<RefCell<Vec<HashSet<CellId>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = reads.clone();
        let observers = ObserverStack::observing(
            Some(Rc::new(move |state: &StateRef| {
                if let Some(top) = sink.borrow_mut().last_mut() {
                    top.insert(state.cell_id());
                }
            })),
            None,
        );
        Self {
            recomposer: recomposer.clone(),
            state: CompositionState::default(),
            applier,
            observers,
            reads,
            disposed: false,
        }
    }

    pub fn recomposer(&self) -> &Recomposer {
        &self.recomposer
    }

    pub fn store(&self) -> &SnapshotStore {
        self.recomposer.store()
    }

    pub fn applier(&self) -> &A {
        &self.applier
    }

    pub fn applier_mut(&mut self) -> &mut A {
        &mut self.applier
    }

    pub fn root(&self) -> Option<ScopeId> {
        self.state.root
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn scope_count(&self) -> usize {
        self.state.scopes.len()
    }

    /// Times `scope` has executed, including the first.
    pub fn recompositions(&self, scope: ScopeId) -> Option<u64> {
        self.state.scopes.get(scope).map(|record| record.recompositions)
    }

    pub fn scope_state(&self, scope: ScopeId) -> ScopeState {
        let Some(record) = self.state.scopes.get(scope) else {
            return ScopeState::Disposed;
        };
        if record.flags.contains(ScopeFlags::COMPOSING) {
            ScopeState::Composing
        } else if record.flags.contains(ScopeFlags::INVALID) || self.recomposer.is_invalidated(scope) {
            ScopeState::Invalid
        } else if self.recomposer.is_scheduled(scope) {
            ScopeState::Scheduled
        } else if record.flags.contains(ScopeFlags::VALID) {
            ScopeState::Valid
        } else {
            ScopeState::Unscheduled
        }
    }

    /// Parent of `scope`, `None` for the root.
    pub fn parent_of(&self, scope: ScopeId) -> Option<ScopeId> {
        self.state.scopes.get(scope).and_then(|record| record.parent)
    }

    pub fn scope_flags(&self, scope: ScopeId) -> Option<ScopeFlags> {
        self.state.scopes.get(scope).map(|record| record.flags)
    }

    /// Key and occurrence `scope` was created under.
    pub fn key_of(&self, scope: ScopeId) -> Option<SlotKey> {
        self.state.scopes.get(scope).map(|record| record.key)
    }

    /// Every live scope, parents first.
    pub fn preorder(&self) -> Vec<ScopeId> {
        self.state
            .root
            .map(|root| self.state.preorder_from(root))
            .unwrap_or_default()
    }

    /// Creates the root scope from `body` and composes it against the empty
    /// tree.
    pub fn compose_initial(
        &mut self,
        body: impl FnMut(&mut Composer<'_, N>) -> Result<(), ComposeError> + 'static,
    ) -> Result<DrainReport, ComposeError> {
        if self.disposed {
            return Err(ComposeError::Disposed);
        }
        if self.state.root.is_some() {
            return Err(ComposeError::AlreadyComposed);
        }
        let body: Body<N> = Rc::new(RefCell::new(body));
        let root = self.state.scopes.insert(ScopeRecord::new(
            SlotKey {
                key: Key(0),
                occurrence: 0,
            },
            None,
            0,
            Container::Root,
            0,
            body,
        ));
        self.state.root = Some(root);
        let mut batch = Batch::default();
        batch.created.push(root);
        self.recomposer.flush_global_writes();
        self.recomposer.track_drain();

        self.run_batch(vec![root], batch)
    }

    pub(crate) fn run_batch(
        &mut self,
        targets: Vec<ScopeId>,
        mut batch: Batch<N>,
    ) -> Result<DrainReport, ComposeError> {
        debug_assert!(self.reads.borrow().is_empty(), "read frames left by a previous batch");
        let started = Instant::now();
        let snapshot = self.recomposer.store().take_mutable_snapshot();

        // Panics are always caught so the batch can be rolled back. Without
        // `catch_panics` the unwind resumes afterwards.
        let executed = {
            let mut composer = Composer::new(
                &mut self.state,
                &mut batch,
                &snapshot,
                &mut self.observers,
                self.reads.clone(),
            );
            catch_unwind(AssertUnwindSafe(|| -> Result<(), ComposeError> {
                for &id in &targets {
                    if composer.batch.composed.contains(&id)
                        || composer.state.detached(id, &composer.batch.removed_set)
                    {
                        continue;
                    }
                    composer.execute(id)?;
                }
                Ok(())
            }))
        };
        let mut unwinding = None;
        let executed = match executed {
            Ok(result) => result,
            Err(payload) => {
                let error = ComposeError::Panicked(panic_message(&*payload));
                if !self.recomposer.config().catch_panics {
                    unwinding = Some(payload);
                }
                Err(error)
            }
        };

        let changes = executed.and_then(|()| {
            snapshot
                .apply()
                .and_then(ApplyResult::check)
                .map_err(ComposeError::from)
        });
        let changes = match changes {
            Ok(changes) => changes,
            Err(error) => {
                snapshot.dispose();
                self.reads.borrow_mut().clear();
                self.rollback(batch);
                let requeue: Vec<ScopeId> = targets
                    .into_iter()
                    .filter(|id| self.state.scopes.contains_key(*id))
                    .collect();
                self.recomposer.abort_drain(&requeue);
                log::debug!("composition batch aborted: {error}");
                if let Some(payload) = unwinding {
                    resume_unwind(payload);
                }
                return Err(error);
            }
        };
        let own_changes: HashSet<CellId> = changes.ids().collect();

        let mut retired = Vec::new();
        for &id in &batch.removed {
            retired.extend(self.state.preorder_from(id));
        }
        let changed = self
            .recomposer
            .finish_drain(&batch.reads, &retired, &own_changes);

        let mut deferred = Vec::new();
        if !changed.is_empty() {
            for (scope, reads) in &batch.reads {
                if !reads.is_disjoint(&changed) {
                    if let Some(record) = self.state.scopes.get_mut(*scope) {
                        record.flags.insert(ScopeFlags::INVALID);
                    }
                    deferred.push(*scope);
                }
            }
            if !deferred.is_empty() {
                log::debug!("deferring {} scope(s) invalidated mid-drain", deferred.len());
                self.recomposer.schedule_recompose(deferred.iter().copied());
            }
        }

        let retired_set: HashSet<ScopeId> = retired.iter().copied().collect();
        let applier_ops = self.commit_nodes(&batch, &retired_set);

        let mut unmounts = std::mem::take(&mut batch.unmounts);
        unmounts.extend(self.state.handles(&retired));
        for &id in &retired {
            self.state.scopes.remove(id);
        }
        self.state.owners.retain(|_, owner| !retired_set.contains(owner));

        let (effects_run, effect_failures) = self.run_effects(unmounts, batch.effects);

        let report = DrainReport {
            recomposed: batch.order,
            deferred,
            disposed: retired,
            applier_ops,
            effects_run,
            effect_failures,
            duration: started.elapsed(),
        };
        log::debug!(
            "drain: {} recomposed, {} disposed, {} applier ops, {} effects in {:?}",
            report.recomposed.len(),
            report.disposed.len(),
            report.applier_ops,
            report.effects_run,
            report.duration
        );
        if report.duration > self.recomposer.config().slow_drain_threshold {
            log::warn!(
                "slow drain: {:?} for {} scope(s)",
                report.duration,
                report.recomposed.len()
            );
        }
        Ok(report)
    }

    fn rollback(&mut self, batch: Batch<N>) {
        for (id, saved) in batch.saved {
            if let Some(record) = self.state.scopes.get_mut(id) {
                saved.restore(record);
            }
        }
        let created: HashSet<ScopeId> = batch.created.into_iter().collect();
        for &id in &created {
            self.state.scopes.remove(id);
        }
        self.state.owners.retain(|_, owner| !created.contains(owner));
        if self.state.root.is_some_and(|root| created.contains(&root)) {
            self.state.root = None;
        }
    }

    fn commit_nodes(&mut self, batch: &Batch<N>, retired: &HashSet<ScopeId>) -> usize {
        let mut dirty: Vec<(Container, usize)> =
            batch.dirty.iter().map(|(container, depth)| (*container, *depth)).collect();
        dirty.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));

        let mut ops = 0;
        for (container, _) in dirty {
            let owner = match container {
                Container::Root => self.state.root,
                Container::Node(_) => self.state.owners.get(&container).copied(),
            };
            let Some(owner) = owner.filter(|owner| !retired.contains(owner)) else {
                self.state.mirror.forget(container);
                continue;
            };
            let Some(path) = self.state.mirror.path(container) else {
                continue;
            };
            let mut new = Vec::new();
            self.state.flatten(owner, &mut new);
            ops += self
                .state
                .mirror
                .sync(container, &path, new, &mut self.applier);
        }
        ops
    }

    /// Unmounts run in reverse, so children go before parents; mounts and side
    /// effects then run in registration order.
    fn run_effects(
        &mut self,
        unmounts: Vec<(ScopeId, Dispose)>,
        effects: Vec<QueuedEffect>,
    ) -> (usize, Vec<EffectFailure>) {
        let mut run = 0;
        let mut failures = Vec::new();
        let mut report = |scope: ScopeId, payload: Box<dyn std::any::Any + Send>| {
            let message = panic_message(&*payload);
            log::error!("effect of scope {:?} panicked: {}", scope, message);
            failures.push(EffectFailure {
                scope: Some(scope),
                message,
            });
        };

        for (scope, handle) in unmounts.into_iter().rev() {
            run += 1;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handle.run())) {
                report(scope, payload);
            }
        }

        for effect in effects {
            run += 1;
            match effect {
                QueuedEffect::Mount { scope, index, run: f } => {
                    match catch_unwind(AssertUnwindSafe(f)) {
                        Ok(handle) => {
                            if let Some(slot) = self
                                .state
                                .scopes
                                .get_mut(scope)
                                .and_then(|record| record.effects.get_mut(index))
                            {
                                slot.handle = Some(handle);
                            } else {
                                handle.run();
                            }
                        }
                        Err(payload) => report(scope, payload),
                    }
                }
                QueuedEffect::Side { scope, run: f } => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                        report(scope, payload);
                    }
                }
            }
        }
        (run, failures)
    }

    /// Runs every outstanding dispose handle, innermost first, clears the
    /// applier and stops tracking. Idempotent.
    pub fn dispose(&mut self) -> Vec<EffectFailure> {
        if self.disposed {
            return Vec::new();
        }
        self.disposed = true;
        self.recomposer.close();

        let scopes = self.preorder();
        let handles = self.state.handles(&scopes);
        let (_, failures) = self.run_effects(handles, Vec::new());

        self.state.scopes.clear();
        self.state.owners.clear();
        self.state.mirror.clear();
        self.state.root = None;
        self.applier.clear();
        log::debug!("composition disposed ({} scopes)", scopes.len());
        failures
    }
}

impl<N: Clone + PartialEq + 'static, A: Applier<N>> Drop for Composition<N, A> {
    fn drop(&mut self) {
        self.dispose();
    }
}
