//! # Read and write observation
//!
//! An [`ObserverStack`] is passed explicitly to every tracked read and write.
//! [`ObserverStack::with_observer`] activates a pair of callbacks for the
//! dynamic extent of a block; activations nest and are all invoked, innermost
//! first.
//!
//! ```rust
//! use repose_snapshot::*;
//! use std::{cell::RefCell, rc::Rc};
//!
//! let store = SnapshotStore::new();
//! let global = store.global_snapshot();
//! let cell = StateCell::new(&global, 1).unwrap();
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let mut observers = ObserverStack::new();
//! let sum = observers.with_observer(
//!     {
//!         let seen = seen.clone();
//!         move |state: &StateRef| seen.borrow_mut().push(state.cell_id())
//!     },
//!     |_| {},
//!     |obs| cell.get(&global, obs).unwrap() + 1,
//! );
//! assert_eq!(sum, 2);
//! assert_eq!(*seen.borrow(), vec![cell.id()]);
//! ```

use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::StateRef;

type Callback = Rc<dyn Fn(&StateRef)>;

#[derive(Clone)]
struct ObserverFrame {
    on_read: Option<Callback>,
    on_write: Option<Callback>,
}

/// Stack of active read/write observers for one logical thread of execution.
#[derive(Clone, Default)]
pub struct ObserverStack {
    frames: Vec<ObserverFrame>,
}

impl ObserverStack {
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// A stack whose bottom frame stays active for the stack's whole lifetime.
    pub fn observing(
        on_read: Option<Rc<dyn Fn(&StateRef)>>,
        on_write: Option<Rc<dyn Fn(&StateRef)>>,
    ) -> Self {
        Self {
            frames: vec![ObserverFrame { on_read, on_write }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Runs `block` with `on_read` / `on_write` active.
    pub fn with_observer<R>(
        &mut self,
        on_read: impl Fn(&StateRef) + 'static,
        on_write: impl Fn(&StateRef) + 'static,
        block: impl FnOnce(&mut ObserverStack) -> R,
    ) -> R {
        let mut guard = self.push(Some(Rc::new(on_read)), Some(Rc::new(on_write)));
        block(&mut *guard)
    }

    pub fn with_read_observer<R>(
        &mut self,
        on_read: impl Fn(&StateRef) + 'static,
        block: impl FnOnce(&mut ObserverStack) -> R,
    ) -> R {
        let mut guard = self.push(Some(Rc::new(on_read)), None);
        block(&mut *guard)
    }

    pub fn with_write_observer<R>(
        &mut self,
        on_write: impl Fn(&StateRef) + 'static,
        block: impl FnOnce(&mut ObserverStack) -> R,
    ) -> R {
        let mut guard = self.push(None, Some(Rc::new(on_write)));
        block(&mut *guard)
    }

    /// Pushes a frame that stays active until the returned guard drops.
    pub fn push(
        &mut self,
        on_read: Option<Rc<dyn Fn(&StateRef)>>,
        on_write: Option<Rc<dyn Fn(&StateRef)>>,
    ) -> ObserverGuard<'_> {
        self.frames.push(ObserverFrame { on_read, on_write });
        ObserverGuard { stack: self }
    }

    pub(crate) fn observes_reads(&self) -> bool {
        self.frames.iter().any(|f| f.on_read.is_some())
    }

    pub(crate) fn observes_writes(&self) -> bool {
        self.frames.iter().any(|f| f.on_write.is_some())
    }

    pub fn notify_read(&self, state: &StateRef) {
        for frame in self.frames.iter().rev() {
            if let Some(on_read) = &frame.on_read {
                on_read(state);
            }
        }
    }

    pub fn notify_write(&self, state: &StateRef) {
        for frame in self.frames.iter().rev() {
            if let Some(on_write) = &frame.on_write {
                on_write(state);
            }
        }
    }
}

/// Pops its observer frame on drop, including on unwind.
pub struct ObserverGuard<'a> {
    stack: &'a mut ObserverStack,
}

impl Deref for ObserverGuard<'_> {
    type Target = ObserverStack;

    fn deref(&self) -> &ObserverStack {
        self.stack
    }
}

impl DerefMut for ObserverGuard<'_> {
    fn deref_mut(&mut self) -> &mut ObserverStack {
        self.stack
    }
}

impl Drop for ObserverGuard<'_> {
    fn drop(&mut self) {
        self.stack.frames.pop();
    }
}
