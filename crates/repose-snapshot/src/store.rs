use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::id::{INVALID_SNAPSHOT, SnapshotIdSet};
use crate::snapshot::SnapshotKind;
use crate::{CellId, ChangeSet, Snapshot, SnapshotId, StateError, StateRef};

/// Called after a snapshot applies to the global state, with the cells it
/// changed and the id of the applied snapshot.
pub type ApplyObserver = Arc<dyn Fn(&ChangeSet, SnapshotId) + Send + Sync>;

/// Called for every write performed directly in the global snapshot.
pub type GlobalWriteObserver = Arc<dyn Fn(&StateRef) + Send + Sync>;

pub(crate) struct GlobalState {
    pub id: SnapshotId,
    pub invalid: Arc<SnapshotIdSet>,
    pub modified: BTreeMap<CellId, StateRef>,
    pin: SnapshotId,
}

pub(crate) struct Registry {
    next_id: SnapshotId,
    pub open: SnapshotIdSet,
    /// Lowest visible id of every open snapshot, with reference counts.
    pins: BTreeMap<SnapshotId, usize>,
    pub global: GlobalState,
    apply_observers: Vec<(u64, ApplyObserver)>,
    write_observers: Vec<(u64, GlobalWriteObserver)>,
    next_handle: u64,
}

impl Registry {
    fn new() -> Self {
        let mut registry = Registry {
            next_id: INVALID_SNAPSHOT + 1,
            open: SnapshotIdSet::new(),
            pins: BTreeMap::new(),
            global: GlobalState {
                id: INVALID_SNAPSHOT,
                invalid: Arc::new(SnapshotIdSet::new()),
                modified: BTreeMap::new(),
                pin: INVALID_SNAPSHOT,
            },
            apply_observers: Vec::new(),
            write_observers: Vec::new(),
            next_handle: 1,
        };
        let id = registry.allocate();
        registry.open.insert(id);
        registry.global.pin = registry.pin(id);
        registry.global.id = id;
        registry
    }

    pub fn allocate(&mut self) -> SnapshotId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// First id not yet handed out; every closed id is below it.
    pub fn peek_next(&self) -> SnapshotId {
        self.next_id
    }

    pub fn pin(&mut self, id: SnapshotId) -> SnapshotId {
        *self.pins.entry(id).or_insert(0) += 1;
        id
    }

    pub fn unpin(&mut self, id: SnapshotId) {
        if let Some(count) = self.pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&id);
            }
        }
    }

    /// Highest id every open snapshot can see through.
    pub fn reuse_limit(&self) -> SnapshotId {
        self.pins
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_id)
            .saturating_sub(1)
    }

    pub fn close(&mut self, id: SnapshotId, previous: &SnapshotIdSet) {
        self.open.remove(id);
        self.open.difference_with(previous);
    }

    /// Closes the current global snapshot and opens a new one. Returns the
    /// changes written in the closed one, if any.
    pub fn advance_global(&mut self) -> Option<(ChangeSet, SnapshotId)> {
        let previous = self.global.id;
        self.open.remove(previous);
        let id = self.allocate();
        let invalid = self.open.clone();
        let pin = self.pin(invalid.lowest_or(id));
        self.unpin(self.global.pin);
        let modified = std::mem::take(&mut self.global.modified);
        self.global = GlobalState {
            id,
            invalid: Arc::new(invalid),
            modified: BTreeMap::new(),
            pin,
        };
        self.open.insert(id);
        if modified.is_empty() {
            None
        } else {
            Some((ChangeSet::new(modified), previous))
        }
    }

    pub fn apply_observers(&self) -> Vec<ApplyObserver> {
        self.apply_observers.iter().map(|(_, o)| o.clone()).collect()
    }

    pub fn write_observers(&self) -> Vec<GlobalWriteObserver> {
        self.write_observers.iter().map(|(_, o)| o.clone()).collect()
    }
}

pub(crate) struct StoreInner {
    pub registry: Mutex<Registry>,
}

/// Process-wide (or test-local) home of the snapshot id counter, the open
/// snapshot set, the pinning table, and the current global snapshot.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone)]
pub struct SnapshotStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                registry: Mutex::new(Registry::new()),
            }),
        }
    }

    /// The process-wide store.
    pub fn global() -> &'static SnapshotStore {
        static GLOBAL: OnceLock<SnapshotStore> = OnceLock::new();
        GLOBAL.get_or_init(SnapshotStore::new)
    }

    /// Handle to the implicit global snapshot. It always refers to the current
    /// global snapshot, across advances.
    pub fn global_snapshot(&self) -> Snapshot {
        Snapshot::global(self.clone())
    }

    pub fn current_global_id(&self) -> SnapshotId {
        self.inner.registry.lock().global.id
    }

    /// Opens a snapshot. Without a parent (or with the global snapshot as
    /// parent) the snapshot is a root snapshot over the global state;
    /// otherwise it is nested in `parent`.
    pub fn open_snapshot(
        &self,
        mutable: bool,
        parent: Option<&Snapshot>,
    ) -> Result<Snapshot, StateError> {
        match parent {
            Some(parent) if parent.kind() != SnapshotKind::Global => {
                if mutable {
                    parent.take_nested_mutable_snapshot()
                } else {
                    parent.take_nested_snapshot()
                }
            }
            _ => Ok(self.open_root(if mutable {
                SnapshotKind::Mutable
            } else {
                SnapshotKind::ReadOnly
            })),
        }
    }

    pub fn take_snapshot(&self) -> Snapshot {
        self.open_root(SnapshotKind::ReadOnly)
    }

    pub fn take_mutable_snapshot(&self) -> Snapshot {
        self.open_root(SnapshotKind::Mutable)
    }

    pub(crate) fn open_root(&self, kind: SnapshotKind) -> Snapshot {
        let (snapshot, notification, observers) = {
            let mut registry = self.inner.registry.lock();
            let mut invalid = registry.open.clone();
            invalid.remove(registry.global.id);
            let id = registry.allocate();
            registry.open.insert(id);
            let pin = registry.pin(invalid.lowest_or(id));
            // Pending global writes become visible to the new snapshot.
            let notification = registry.advance_global();
            let observers = if notification.is_some() {
                registry.apply_observers()
            } else {
                Vec::new()
            };
            let snapshot = Snapshot::root(self.clone(), kind, id, invalid, pin);
            (snapshot, notification, observers)
        };
        if let Some((changes, applied)) = notification {
            notify_apply(&observers, &changes, applied);
        }
        log::trace!("opened {:?} snapshot {}", kind, snapshot.id());
        snapshot
    }

    /// Runs `block` in a new mutable snapshot and applies it.
    ///
    /// The snapshot is disposed when `block` unwinds or the apply conflicts.
    pub fn with_mutable_snapshot<R>(
        &self,
        block: impl FnOnce(&Snapshot) -> R,
    ) -> Result<R, StateError> {
        struct DisposeOnExit(Snapshot);
        impl Drop for DisposeOnExit {
            fn drop(&mut self) {
                self.0.dispose();
            }
        }

        let guard = DisposeOnExit(self.take_mutable_snapshot());
        let result = block(&guard.0);
        guard.0.apply()?.check()?;
        Ok(result)
    }

    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<crate::ApplyResult, StateError> {
        snapshot.apply()
    }

    pub fn dispose_snapshot(&self, snapshot: &Snapshot) {
        snapshot.dispose();
    }

    /// Makes writes performed in the global snapshot visible and notifies
    /// apply observers. Returns whether there was anything to send.
    pub fn send_apply_notifications(&self) -> bool {
        let (notification, observers) = {
            let mut registry = self.inner.registry.lock();
            if registry.global.modified.is_empty() {
                return false;
            }
            let notification = registry.advance_global();
            (notification, registry.apply_observers())
        };
        if let Some((changes, applied)) = notification {
            notify_apply(&observers, &changes, applied);
        }
        true
    }

    pub fn register_apply_observer(
        &self,
        observer: impl Fn(&ChangeSet, SnapshotId) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let mut registry = self.inner.registry.lock();
        let handle = registry.next_handle;
        registry.next_handle += 1;
        registry.apply_observers.push((handle, Arc::new(observer)));
        ObserverHandle {
            store: Arc::downgrade(&self.inner),
            kind: HandleKind::Apply,
            handle,
        }
    }

    pub fn register_global_write_observer(
        &self,
        observer: impl Fn(&StateRef) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let mut registry = self.inner.registry.lock();
        let handle = registry.next_handle;
        registry.next_handle += 1;
        registry.write_observers.push((handle, Arc::new(observer)));
        ObserverHandle {
            store: Arc::downgrade(&self.inner),
            kind: HandleKind::GlobalWrite,
            handle,
        }
    }

    /// Number of snapshot ids not yet visible globally, including the global
    /// snapshot itself.
    pub fn open_snapshot_count(&self) -> usize {
        self.inner.registry.lock().open.len()
    }
}

pub(crate) fn notify_apply(observers: &[ApplyObserver], changes: &ChangeSet, applied: SnapshotId) {
    for observer in observers {
        observer(changes, applied);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandleKind {
    Apply,
    GlobalWrite,
}

/// Registration of an apply or global write observer.
pub struct ObserverHandle {
    store: Weak<StoreInner>,
    kind: HandleKind,
    handle: u64,
}

impl ObserverHandle {
    /// Unregisters the observer. Safe to call more than once.
    pub fn dispose(&self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let mut registry = store.registry.lock();
        match self.kind {
            HandleKind::Apply => registry.apply_observers.retain(|(h, _)| *h != self.handle),
            HandleKind::GlobalWrite => registry.write_observers.retain(|(h, _)| *h != self.handle),
        }
    }
}
