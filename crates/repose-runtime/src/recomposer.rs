//! Invalidation tracking and the drain point.
//!
//! The [`Recomposer`] is the thread-safe half of the runtime: it owns the
//! dependency index (cell → scopes that read it) and the pending set. Any
//! thread may write state and apply snapshots; the store's apply observer routes
//! the changed cells here, and the UI thread drains them with
//! [`Composition::perform_recompose`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use repose_snapshot::{CellId, ObserverHandle, SnapshotStore};
use web_time::{Duration, Instant};

use crate::reactive::DepGraph;
use crate::{Applier, ComposeError, Composition, EffectFailure, RecomposerConfig, ScopeId};

type FrameCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TrackerState {
    graph: DepGraph,
    pending: HashSet<ScopeId>,
    /// Pending because a cell they read changed, as opposed to an explicit
    /// `schedule_recompose`.
    invalidated: HashSet<ScopeId>,
    draining: bool,
    changed_during_drain: HashSet<CellId>,
    global_writes: bool,
    closed: bool,
}

impl TrackerState {
    fn has_work(&self) -> bool {
        !self.closed && (!self.pending.is_empty() || self.global_writes)
    }
}

struct Shared {
    store: SnapshotStore,
    config: RecomposerConfig,
    state: Mutex<TrackerState>,
    work: Condvar,
    frame_callback: Mutex<Option<FrameCallback>>,
    handles: Mutex<Vec<ObserverHandle>>,
}

impl Shared {
    fn notify_writes(&self, cells: impl IntoIterator<Item = CellId>) -> Vec<ScopeId> {
        let (dependents, woke) = {
            let mut state = self.state.lock();
            if state.closed {
                return Vec::new();
            }
            let cells: Vec<CellId> = cells.into_iter().collect();
            if state.draining {
                state.changed_during_drain.extend(cells.iter().copied());
            }
            let dependents = state.graph.dependents(&cells);
            let mut woke = false;
            for &scope in &dependents {
                woke |= state.pending.insert(scope);
                state.invalidated.insert(scope);
            }
            (dependents, woke)
        };
        if woke {
            log::trace!("invalidated {} scope(s)", dependents.len());
            self.wake();
        }
        dependents
    }

    fn note_global_write(&self) {
        let first = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            !std::mem::replace(&mut state.global_writes, true)
        };
        if first {
            self.wake();
        }
    }

    fn wake(&self) {
        self.work.notify_all();
        let callback = self.frame_callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().drain(..) {
            handle.dispose();
        }
    }
}

/// Thread-safe invalidation tracker. Cloning shares the same tracker.
#[derive(Clone)]
pub struct Recomposer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Recomposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Recomposer")
            .field("pending", &state.pending.len())
            .field("tracked_scopes", &state.graph.tracked_scopes())
            .field("closed", &state.closed)
            .finish()
    }
}

impl Recomposer {
    pub fn new(store: &SnapshotStore) -> Self {
        Self::with_config(store, RecomposerConfig::default())
    }

    /// Creates a tracker listening to applies and global writes on `store`.
    /// Drive exactly one [`Composition`] with it.
    pub fn with_config(store: &SnapshotStore, config: RecomposerConfig) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let on_apply = weak.clone();
            let apply = store.register_apply_observer(move |changes, _| {
                if let Some(shared) = on_apply.upgrade() {
                    shared.notify_writes(changes.ids());
                }
            });
            let on_write = weak.clone();
            let write = store.register_global_write_observer(move |_| {
                if let Some(shared) = on_write.upgrade() {
                    shared.note_global_write();
                }
            });
            Shared {
                store: store.clone(),
                config,
                state: Mutex::new(TrackerState::default()),
                work: Condvar::new(),
                frame_callback: Mutex::new(None),
                handles: Mutex::new(vec![apply, write]),
            }
        });
        Self { shared }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.shared.store
    }

    pub fn config(&self) -> &RecomposerConfig {
        &self.shared.config
    }

    /// Schedules every scope that read one of `cells`. Returns those scopes.
    pub fn notify_writes(&self, cells: impl IntoIterator<Item = CellId>) -> Vec<ScopeId> {
        self.shared.notify_writes(cells)
    }

    /// Adds `scopes` to the pending set. Already pending scopes are left as is.
    pub fn schedule_recompose(&self, scopes: impl IntoIterator<Item = ScopeId>) {
        let woke = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            let mut woke = false;
            for scope in scopes {
                woke |= state.pending.insert(scope);
            }
            woke
        };
        if woke {
            self.shared.wake();
        }
    }

    /// Pending scopes, or global writes not yet sent.
    pub fn has_pending_work(&self) -> bool {
        self.shared.state.lock().has_work()
    }

    pub fn is_scheduled(&self, scope: ScopeId) -> bool {
        self.shared.state.lock().pending.contains(&scope)
    }

    pub(crate) fn is_invalidated(&self, scope: ScopeId) -> bool {
        self.shared.state.lock().invalidated.contains(&scope)
    }

    pub fn pending_scopes(&self) -> Vec<ScopeId> {
        let mut scopes: Vec<ScopeId> = self.shared.state.lock().pending.iter().copied().collect();
        scopes.sort_unstable();
        scopes
    }

    /// Cells `scope` read during its last execution.
    pub fn reads_of(&self, scope: ScopeId) -> Vec<CellId> {
        self.shared.state.lock().graph.reads_of(scope)
    }

    /// Blocks until there is work or `timeout` elapses. Returns whether there
    /// is work.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.has_work() {
                return true;
            }
            if state.closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared.work.wait_for(&mut state, deadline - now);
        }
    }

    /// Called, from whichever thread scheduled it, whenever new work arrives.
    pub fn set_frame_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.shared.frame_callback.lock() = Some(Arc::new(callback));
    }

    /// Drops all pending work and tracking. Later scheduling is ignored.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.pending.clear();
            state.invalidated.clear();
            state.changed_during_drain.clear();
            state.graph.clear();
        }
        self.shared.work.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Swaps out the pending set; anything scheduled from now on lands in a
    /// fresh one.
    pub(crate) fn begin_drain(&self) -> Vec<ScopeId> {
        let mut state = self.shared.state.lock();
        state.draining = true;
        state.changed_during_drain.clear();
        state.invalidated.clear();
        std::mem::take(&mut state.pending).into_iter().collect()
    }

    /// Starts collecting changed cells without touching the pending set.
    pub(crate) fn track_drain(&self) {
        let mut state = self.shared.state.lock();
        state.draining = true;
        state.changed_during_drain.clear();
    }

    /// Clears the global write flag, then sends pending global writes. A
    /// write landing during or after the send raises the flag again.
    pub(crate) fn flush_global_writes(&self) {
        self.shared.state.lock().global_writes = false;
        self.shared.store.send_apply_notifications();
    }

    /// Ends a drain that committed nothing. `requeue` goes back to pending.
    pub(crate) fn abort_drain(&self, requeue: &[ScopeId]) {
        let mut state = self.shared.state.lock();
        state.draining = false;
        state.changed_during_drain.clear();
        if !state.closed {
            state.pending.extend(requeue.iter().copied());
        }
    }

    /// Ends a committed drain: replaces the read sets of the executed scopes,
    /// forgets retired ones, and returns the cells changed by others while the
    /// drain ran.
    pub(crate) fn finish_drain(
        &self,
        reads: &[(ScopeId, HashSet<CellId>)],
        retired: &[ScopeId],
        own_changes: &HashSet<CellId>,
    ) -> HashSet<CellId> {
        let mut state = self.shared.state.lock();
        state.draining = false;
        if state.closed {
            return HashSet::new();
        }
        for (scope, cells) in reads {
            state.graph.record(*scope, cells.clone());
        }
        for scope in retired {
            state.graph.remove_scope(*scope);
            state.pending.remove(scope);
            state.invalidated.remove(scope);
        }
        let mut changed = std::mem::take(&mut state.changed_during_drain);
        changed.retain(|cell| !own_changes.contains(cell));
        changed
    }
}

/// What one drain did.
#[derive(Clone, Debug, Default)]
pub struct DrainReport {
    /// Scopes re-executed, in execution order.
    pub recomposed: Vec<ScopeId>,
    /// Scopes whose reads went stale during the drain, pending again.
    pub deferred: Vec<ScopeId>,
    /// Scopes removed from the composition.
    pub disposed: Vec<ScopeId>,
    pub applier_ops: usize,
    pub effects_run: usize,
    pub effect_failures: Vec<EffectFailure>,
    pub duration: Duration,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.recomposed.is_empty() && self.disposed.is_empty() && self.effects_run == 0
    }
}

impl<N: Clone + PartialEq + 'static, A: Applier<N>> Composition<N, A> {
    /// Drains the pending set: re-executes invalidated scopes ancestor-first
    /// in one batch snapshot, applies it, then updates the node tree and runs
    /// effects. On error nothing is committed and the scopes stay pending.
    pub fn perform_recompose(&mut self) -> Result<DrainReport, ComposeError> {
        if self.is_disposed() {
            return Ok(DrainReport::default());
        }
        self.recomposer.flush_global_writes();
        let pending = self.recomposer.begin_drain();

        let order: HashMap<ScopeId, usize> = self
            .preorder()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        let mut targets: Vec<ScopeId> = pending
            .into_iter()
            .filter(|id| order.contains_key(id))
            .collect();
        if targets.is_empty() {
            self.recomposer.abort_drain(&[]);
            return Ok(DrainReport::default());
        }
        targets.sort_by_key(|id| order[id]);

        self.run_batch(targets, Default::default())
    }
}
