use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::id::SnapshotIdSet;
use crate::policy::{MutationPolicy, StructuralEquality};
use crate::record::RecordChain;
use crate::{CellId, ObserverStack, Snapshot, SnapshotId, StateError};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased view of a state cell, as seen by snapshots and observers.
pub trait StateObject: Send + Sync + 'static {
    fn cell_id(&self) -> CellId;

    /// Snapshot id of the record visible to `(snapshot, invalid)`.
    fn readable_id(&self, snapshot: SnapshotId, invalid: &SnapshotIdSet) -> Option<SnapshotId>;

    /// Revision of the record visible to `(snapshot, invalid)`. Changes on
    /// every write that could change what the snapshot reads.
    fn readable_revision(&self, snapshot: SnapshotId, invalid: &SnapshotIdSet) -> Option<u64>;

    /// Decides how a concurrent write is reconciled. Must not modify the
    /// cell; a merged value is written later through [`commit_merge`].
    ///
    /// [`commit_merge`]: StateObject::commit_merge
    fn merge_records(
        &self,
        previous: SnapshotId,
        current: SnapshotId,
        applied: SnapshotId,
    ) -> MergeOutcome;

    /// Replaces the value of the record written by `applied`.
    fn commit_merge(&self, applied: SnapshotId, value: MergedValue);

    /// Makes the records written by `owned` invisible to every snapshot.
    fn abandon(&self, owned: &SnapshotIdSet);

    fn record_count(&self) -> usize;

    fn type_name(&self) -> &'static str;
}

pub type StateRef = Arc<dyn StateObject>;

/// A merged value awaiting commit.
pub struct MergedValue(Box<dyn Any + Send>);

impl MergedValue {
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast<T: 'static>(self) -> Option<T> {
        self.0.downcast::<T>().ok().map(|v| *v)
    }
}

pub enum MergeOutcome {
    Conflict,
    /// The applying snapshot's record is kept as written.
    KeepApplied,
    /// The applying snapshot's record takes the merged value.
    Merged(MergedValue),
    /// The merged value equals the current one; the cell is dropped from the
    /// change set so observers are not notified twice.
    Reverted(MergedValue),
}

impl fmt::Debug for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeOutcome::Conflict => f.write_str("Conflict"),
            MergeOutcome::KeepApplied => f.write_str("KeepApplied"),
            MergeOutcome::Merged(_) => f.write_str("Merged(..)"),
            MergeOutcome::Reverted(_) => f.write_str("Reverted(..)"),
        }
    }
}

struct CellInner<T> {
    id: CellId,
    records: RwLock<RecordChain<T>>,
    policy: Box<dyn MutationPolicy<T>>,
}

impl<T: Clone + Send + Sync + 'static> CellInner<T> {
    fn write_record(
        &self,
        snapshot: SnapshotId,
        invalid: &SnapshotIdSet,
        reuse_limit: SnapshotId,
        value: T,
    ) -> Result<(), StateError> {
        let mut chain = self.records.write();
        let index = chain
            .readable_index(snapshot, invalid)
            .ok_or(StateError::NoReadableRecord {
                cell: self.id,
                snapshot,
            })?;
        if chain.get(index).snapshot_id == snapshot {
            chain.overwrite(index, value);
        } else {
            chain.push(snapshot, value);
            chain.prune(reuse_limit);
        }
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> StateObject for CellInner<T> {
    fn cell_id(&self) -> CellId {
        self.id
    }

    fn readable_id(&self, snapshot: SnapshotId, invalid: &SnapshotIdSet) -> Option<SnapshotId> {
        self.records
            .read()
            .readable(snapshot, invalid)
            .map(|r| r.snapshot_id)
    }

    fn readable_revision(&self, snapshot: SnapshotId, invalid: &SnapshotIdSet) -> Option<u64> {
        self.records
            .read()
            .readable(snapshot, invalid)
            .map(|r| r.revision)
    }

    fn merge_records(
        &self,
        previous: SnapshotId,
        current: SnapshotId,
        applied: SnapshotId,
    ) -> MergeOutcome {
        let chain = self.records.read();
        let (Some(p), Some(c), Some(a)) = (chain.find(previous), chain.find(current), chain.find(applied))
        else {
            return MergeOutcome::Conflict;
        };
        let (previous, current, applied) = (&chain.get(p).value, &chain.get(c).value, &chain.get(a).value);

        if self.policy.equivalent(current, applied) {
            return MergeOutcome::Reverted(MergedValue::new(current.clone()));
        }
        match self.policy.merge(previous, current, applied) {
            None => MergeOutcome::Conflict,
            Some(merged) if self.policy.equivalent(&merged, applied) => MergeOutcome::KeepApplied,
            Some(merged) if self.policy.equivalent(&merged, current) => {
                MergeOutcome::Reverted(MergedValue::new(merged))
            }
            Some(merged) => MergeOutcome::Merged(MergedValue::new(merged)),
        }
    }

    fn commit_merge(&self, applied: SnapshotId, value: MergedValue) {
        let Some(value) = value.downcast::<T>() else {
            log::error!(
                "merged value for cell {} is not a {}",
                self.id,
                std::any::type_name::<T>()
            );
            return;
        };
        let mut chain = self.records.write();
        if let Some(index) = chain.find(applied) {
            chain.overwrite(index, value);
        }
    }

    fn abandon(&self, owned: &SnapshotIdSet) {
        self.records.write().abandon(owned);
    }

    fn record_count(&self) -> usize {
        self.records.read().len()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A multi-version mutable cell.
///
/// Every read and write goes through a [`Snapshot`]; each snapshot sees the
/// value as of when it was taken plus its own writes.
pub struct StateCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for StateCell<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> fmt::Debug for StateCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("id", &self.inner.id)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> StateCell<T> {
    /// Creates a cell whose initial value is visible only to `snapshot` until
    /// it applies. Uses [`StructuralEquality`].
    pub fn new(snapshot: &Snapshot, value: T) -> Result<Self, StateError> {
        Self::with_policy(snapshot, value, StructuralEquality)
    }
}

impl<T: Clone + Send + Sync + 'static> StateCell<T> {
    pub fn with_policy(
        snapshot: &Snapshot,
        value: T,
        policy: impl MutationPolicy<T>,
    ) -> Result<Self, StateError> {
        let cell = Self {
            inner: Arc::new(CellInner {
                id: NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed),
                records: RwLock::new(RecordChain::empty()),
                policy: Box::new(policy),
            }),
        };
        let object = cell.as_state_object();
        snapshot.record_write(&object, |id, _, _| {
            cell.inner.records.write().push(id, value);
            Ok(())
        })?;
        Ok(cell)
    }

    pub fn id(&self) -> CellId {
        self.inner.id
    }

    pub fn as_state_object(&self) -> StateRef {
        self.inner.clone()
    }

    /// Number of records currently retained. Exposed for diagnostics.
    pub fn record_count(&self) -> usize {
        self.inner.records.read().len()
    }

    /// Reads the value visible in `snapshot`, notifying read observers.
    pub fn get(&self, snapshot: &Snapshot, observers: &ObserverStack) -> Result<T, StateError> {
        self.with(snapshot, observers, T::clone)
    }

    pub fn get_untracked(&self, snapshot: &Snapshot) -> Result<T, StateError> {
        self.read_raw(snapshot, T::clone)
    }

    /// Borrows the visible value instead of cloning it.
    pub fn with<R>(
        &self,
        snapshot: &Snapshot,
        observers: &ObserverStack,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R, StateError> {
        if observers.observes_reads() {
            observers.notify_read(&self.as_state_object());
        }
        self.read_raw(snapshot, f)
    }

    fn read_raw<R>(&self, snapshot: &Snapshot, f: impl FnOnce(&T) -> R) -> Result<R, StateError> {
        let (id, invalid) = snapshot.view()?;
        let chain = self.inner.records.read();
        let record = chain
            .readable(id, &invalid)
            .ok_or(StateError::NoReadableRecord {
                cell: self.inner.id,
                snapshot: id,
            })?;
        Ok(f(&record.value))
    }

    /// Writes `value` in `snapshot`. A value equivalent to the visible one is
    /// not a write: no record is created and no observer runs.
    pub fn set(
        &self,
        snapshot: &Snapshot,
        observers: &ObserverStack,
        value: T,
    ) -> Result<(), StateError> {
        let unchanged = self.read_raw(snapshot, |current| self.inner.policy.equivalent(current, &value))?;
        if unchanged {
            return Ok(());
        }
        let object = self.as_state_object();
        snapshot.record_write(&object, |id, invalid, reuse_limit| {
            self.inner.write_record(id, invalid, reuse_limit, value)
        })?;
        if observers.observes_writes() {
            observers.notify_write(&object);
        }
        Ok(())
    }

    pub fn set_untracked(&self, snapshot: &Snapshot, value: T) -> Result<(), StateError> {
        self.set(snapshot, &ObserverStack::new(), value)
    }

    /// Read-modify-write of the visible value.
    pub fn update(
        &self,
        snapshot: &Snapshot,
        observers: &ObserverStack,
        f: impl FnOnce(&mut T),
    ) -> Result<(), StateError> {
        let mut value = self.read_raw(snapshot, T::clone)?;
        f(&mut value);
        self.set(snapshot, observers, value)
    }

    pub fn update_untracked(&self, snapshot: &Snapshot, f: impl FnOnce(&mut T)) -> Result<(), StateError> {
        self.update(snapshot, &ObserverStack::new(), f)
    }
}
