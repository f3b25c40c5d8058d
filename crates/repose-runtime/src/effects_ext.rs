use std::rc::Rc;

use crate::effects::{EffectKind, EffectSlot, QueuedEffect};
use crate::{Composer, Dispose};

impl<N: Clone + PartialEq + 'static> Composer<'_, N> {
    /// cleanup on key change or unmount
    pub fn disposable_effect<K: PartialEq + 'static>(
        &mut self,
        key: K,
        effect: impl FnOnce() -> Dispose + 'static,
    ) {
        let unchanged = self.previous_effect().is_some_and(|slot| {
            slot.kind == EffectKind::Keyed
                && slot
                    .key
                    .as_ref()
                    .and_then(|k| k.downcast_ref::<K>())
                    .is_some_and(|k| *k == key)
        });
        if unchanged {
            self.keep_previous_effect();
            return;
        }

        let Some(index) = self.push_effect(EffectSlot {
            kind: EffectKind::Keyed,
            key: Some(Rc::new(key)),
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

    /// Runs once (on mount) and disposes on unmount.
    pub fn launched_effect(&mut self, effect: impl FnOnce() -> Dispose + 'static) {
        self.disposable_effect((), effect);
    }

    /// runs after every successful composition
    pub fn side_effect(&mut self, effect: impl FnOnce() + 'static) {
        let scope = self.current_scope();
        self.batch.effects.push(QueuedEffect::Side {
            scope,
            run: Box::new(effect),
        });
    }
}
