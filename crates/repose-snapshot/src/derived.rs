use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{CellId, ObserverStack, Snapshot, StateError, StateRef};

type Compute<T> = dyn Fn(&Snapshot, &mut ObserverStack) -> Result<T, StateError> + Send + Sync;

struct Cached<T> {
    value: T,
    /// Each dependency with the record revision it was computed from.
    deps: Vec<(StateRef, u64)>,
}

struct DerivedInner<T> {
    compute: Box<Compute<T>>,
    cache: Mutex<Option<Cached<T>>>,
}

/// A value computed from state cells, cached until one of the cells it read
/// is written.
///
/// Reading it reports the underlying cells to the active read observers, so
/// whoever reads derived state is invalidated by its dependencies.
pub struct DerivedState<T> {
    inner: Arc<DerivedInner<T>>,
}

impl<T> Clone for DerivedState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DerivedState<T> {
    pub fn new(
        compute: impl Fn(&Snapshot, &mut ObserverStack) -> Result<T, StateError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(DerivedInner {
                compute: Box::new(compute),
                cache: Mutex::new(None),
            }),
        }
    }

    pub fn get(&self, snapshot: &Snapshot, observers: &mut ObserverStack) -> Result<T, StateError> {
        let (id, invalid) = snapshot.view()?;
        let hit = {
            let cache = self.inner.cache.lock();
            match cache.as_ref() {
                Some(cached)
                    if cached
                        .deps
                        .iter()
                        .all(|(state, record)| state.readable_revision(id, &invalid) == Some(*record)) =>
                {
                    let deps: Vec<StateRef> = cached.deps.iter().map(|(s, _)| s.clone()).collect();
                    Some((cached.value.clone(), deps))
                }
                _ => None,
            }
        };
        if let Some((value, deps)) = hit {
            for dep in &deps {
                observers.notify_read(dep);
            }
            return Ok(value);
        }

        let reads: Rc<RefCell<Vec<StateRef>>> = Rc::default();
        let value = observers.with_read_observer(
            {
                let reads = reads.clone();
                move |state: &StateRef| reads.borrow_mut().push(state.clone())
            },
            |obs| (self.inner.compute)(snapshot, obs),
        )?;

        let mut seen = HashSet::new();
        let deps: Vec<(StateRef, u64)> = reads
            .take()
            .into_iter()
            .filter(|s| seen.insert(s.cell_id()))
            .filter_map(|s| s.readable_revision(id, &invalid).map(|record| (s, record)))
            .collect();
        *self.inner.cache.lock() = Some(Cached {
            value: value.clone(),
            deps,
        });
        Ok(value)
    }

    /// Drops the cached value; the next read recomputes.
    pub fn invalidate(&self) {
        *self.inner.cache.lock() = None;
    }

    /// Cells read by the last computation.
    pub fn dependencies(&self) -> Vec<CellId> {
        self.inner
            .cache
            .lock()
            .as_ref()
            .map(|c| c.deps.iter().map(|(s, _)| s.cell_id()).collect())
            .unwrap_or_default()
    }
}
