//! Mutation policies decide when a write is a change and how concurrent
//! writes to the same cell are reconciled on apply.

use std::sync::Arc;

pub trait MutationPolicy<T>: Send + Sync + 'static {
    /// Writing a value equivalent to the current one is not a change.
    fn equivalent(&self, a: &T, b: &T) -> bool;

    /// Three-way merge for a cell written both by the applying snapshot
    /// (`applied`) and by a snapshot applied after it was opened (`current`),
    /// starting from the value it originally saw (`previous`).
    ///
    /// `None` fails the apply with a conflict.
    fn merge(&self, previous: &T, current: &T, applied: &T) -> Option<T> {
        let _ = (previous, current, applied);
        None
    }
}

/// Values compare with `==`. Concurrent writes of equal values merge.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralEquality;

impl<T: PartialEq> MutationPolicy<T> for StructuralEquality {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Shared values compare by pointer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferentialEquality;

impl<U: ?Sized + Send + Sync + 'static> MutationPolicy<Arc<U>> for ReferentialEquality {
    fn equivalent(&self, a: &Arc<U>, b: &Arc<U>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

/// Every write is a change, and concurrent writes always conflict.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverEqual;

impl<T> MutationPolicy<T> for NeverEqual {
    fn equivalent(&self, _a: &T, _b: &T) -> bool {
        false
    }
}

/// Adapts a closure into a merge policy on top of structural equality.
pub struct MergeWith<F>(pub F);

impl<T, F> MutationPolicy<T> for MergeWith<F>
where
    T: PartialEq,
    F: Fn(&T, &T, &T) -> Option<T> + Send + Sync + 'static,
{
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }

    fn merge(&self, previous: &T, current: &T, applied: &T) -> Option<T> {
        (self.0)(previous, current, applied)
    }
}
