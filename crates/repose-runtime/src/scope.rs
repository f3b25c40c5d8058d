use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use bitflags::bitflags;

use crate::effects::EffectSlot;
use crate::{ComposeError, Composer};

slotmap::new_key_type! {
    /// Stable identity of a recompose scope. Survives re-execution.
    pub struct ScopeId;
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ScopeFlags: u8 {
        const COMPOSING = 1 << 0;
        const VALID     = 1 << 1;
        /// A dependency changed after the scope last read it.
        const INVALID   = 1 << 2;
        /// Re-executed by its parent only when its inputs change.
        const SKIPPABLE = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeState {
    Unscheduled,
    Scheduled,
    Composing,
    Valid,
    Invalid,
    Disposed,
}

/// Position-independent identity of a call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub u64);

impl Key {
    pub fn of(value: impl Hash) -> Key {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        Key(hasher.finish())
    }
}

impl From<u64> for Key {
    fn from(v: u64) -> Self {
        Key(v)
    }
}

impl From<usize> for Key {
    fn from(v: usize) -> Self {
        Key(v as u64)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::of(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::of(v)
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::of(v)
    }
}

/// A key unique to the call site it is written at.
#[macro_export]
macro_rules! key {
    () => {
        $crate::Key::of(concat!(module_path!(), ":", line!(), ":", column!()))
    };
    ($extra:expr) => {
        $crate::Key::of((concat!(module_path!(), ":", line!(), ":", column!()), &$extra))
    };
}

/// A key plus the number of earlier siblings that used the same key in the
/// same execution, so repeated keys stay distinct and stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub key: Key,
    pub occurrence: u32,
}

/// A node, identified by the scope that emitted it and its slot there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub scope: ScopeId,
    pub slot: SlotKey,
}

/// A list of sibling nodes in the applier's tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Container {
    Root,
    /// Children of a node.
    Node(NodeId),
}

#[derive(Clone)]
pub(crate) enum Slot<N> {
    Node {
        slot: SlotKey,
        node: N,
        content: Option<ScopeId>,
    },
    Scope {
        slot: SlotKey,
        id: ScopeId,
    },
}

impl<N> Slot<N> {
    pub fn key(&self) -> SlotKey {
        match self {
            Slot::Node { slot, .. } | Slot::Scope { slot, .. } => *slot,
        }
    }

    /// Child scope owned by this slot, if any.
    pub fn child(&self) -> Option<ScopeId> {
        match self {
            Slot::Node { content, .. } => *content,
            Slot::Scope { id, .. } => Some(*id),
        }
    }
}

pub(crate) type Body<N> = Rc<RefCell<dyn FnMut(&mut Composer<'_, N>) -> Result<(), ComposeError>>>;

pub(crate) struct ScopeRecord<N> {
    pub key: SlotKey,
    pub parent: Option<ScopeId>,
    pub depth: usize,
    pub container: Container,
    /// Nesting depth of `container` in the node tree.
    pub container_depth: usize,
    pub slots: Vec<Slot<N>>,
    pub body: Option<Body<N>>,
    pub remembered: Vec<Rc<dyn Any>>,
    pub keyed: HashMap<Key, Rc<dyn Any>>,
    pub effects: Vec<EffectSlot>,
    pub inputs: Option<Rc<dyn Any>>,
    pub flags: ScopeFlags,
    pub recompositions: u64,
}

impl<N> ScopeRecord<N> {
    pub fn new(
        key: SlotKey,
        parent: Option<ScopeId>,
        depth: usize,
        container: Container,
        container_depth: usize,
        body: Body<N>,
    ) -> Self {
        Self {
            key,
            parent,
            depth,
            container,
            container_depth,
            slots: Vec::new(),
            body: Some(body),
            remembered: Vec::new(),
            keyed: HashMap::new(),
            effects: Vec::new(),
            inputs: None,
            flags: ScopeFlags::empty(),
            recompositions: 0,
        }
    }
}

/// Copy of a scope taken before a batch first touches it.
pub(crate) struct SavedScope<N> {
    slots: Vec<Slot<N>>,
    body: Option<Body<N>>,
    remembered: Vec<Rc<dyn Any>>,
    keyed: HashMap<Key, Rc<dyn Any>>,
    effects: Vec<EffectSlot>,
    inputs: Option<Rc<dyn Any>>,
    flags: ScopeFlags,
    recompositions: u64,
}

impl<N: Clone> SavedScope<N> {
    pub fn capture(record: &ScopeRecord<N>) -> Self {
        Self {
            slots: record.slots.clone(),
            body: record.body.clone(),
            remembered: record.remembered.clone(),
            keyed: record.keyed.clone(),
            effects: record.effects.clone(),
            inputs: record.inputs.clone(),
            flags: record.flags,
            recompositions: record.recompositions,
        }
    }

    pub fn restore(self, record: &mut ScopeRecord<N>) {
        record.slots = self.slots;
        record.body = self.body;
        record.remembered = self.remembered;
        record.keyed = self.keyed;
        record.effects = self.effects;
        record.inputs = self.inputs;
        record.flags = self.flags;
        record.recompositions = self.recompositions;
    }
}
