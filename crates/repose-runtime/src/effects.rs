use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::{Composer, ScopeId};

#[derive(Clone)]
pub struct Dispose(Rc<RefCell<Option<Box<dyn FnOnce()>>>>);

impl Dispose {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Rc::new(RefCell::new(Some(Box::new(f)))))
    }

    /// A handle with nothing to clean up.
    pub fn noop() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    /// Runs at most once (safe to call multiple times).
    pub fn run(&self) {
        let f = self.0.borrow_mut().take();
        if let Some(f) = f {
            f()
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.0.borrow().is_none()
    }
}

impl std::fmt::Debug for Dispose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Dispose").field(&!self.is_consumed()).finish()
    }
}

/// Helper to register cleanup inside effect.
pub fn on_unmount(f: impl FnOnce() + 'static) -> Dispose {
    Dispose::new(f)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EffectKind {
    Commit,
    Keyed,
}

/// Effect registered at one position of a scope's execution.
#[derive(Clone)]
pub(crate) struct EffectSlot {
    pub kind: EffectKind,
    pub key: Option<Rc<dyn Any>>,
    /// Set once the effect has run after a successful drain.
    pub handle: Option<Dispose>,
}

/// Effect waiting for the structural changes of a drain to land.
pub(crate) enum QueuedEffect {
    /// Runs and stores its handle in `effects[index]` of `scope`.
    Mount {
        scope: ScopeId,
        index: usize,
        run: Box<dyn FnOnce() -> Dispose>,
    },
    Side {
        scope: ScopeId,
        run: Box<dyn FnOnce()>,
    },
}

impl<N: Clone + PartialEq + 'static> Composer<'_, N> {
    /// Runs `effect` after every successful composition of the current scope.
    /// The handle returned by the previous run is disposed first; the last
    /// one is disposed when the scope leaves the composition.
    pub fn on_commit(&mut self, effect: impl FnOnce() -> Dispose + 'static) {
        let Some(index) = self.push_effect(EffectSlot {
            kind: EffectKind::Commit,
            key: None,
            handle: None,
        }) else {
            return;
        };
        let scope = self.current_scope();
        self.batch.effects.push(QueuedEffect::Mount {
            scope,
            index,
            run: Box::new(effect),
        });
    }
}
