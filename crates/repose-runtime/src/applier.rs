//! The node tree mutation interface driven by a composition.
//!
//! The runtime never inspects nodes; it only tells the applier where to put
//! them. All indices refer to the children of the *current* container, which
//! starts at the root and is changed with [`Applier::down`] / [`Applier::up`].

use std::fmt::{self, Write as _};

pub trait Applier<N> {
    fn insert(&mut self, index: usize, node: N);

    fn remove(&mut self, index: usize, count: usize);

    /// Moves `count` nodes starting at `from` so that they start at `to` in
    /// the resulting list.
    fn move_nodes(&mut self, from: usize, to: usize, count: usize);

    /// Removes every node, at every level.
    fn clear(&mut self);

    /// Replaces the node at `index`. The default removes and reinserts it,
    /// dropping its children.
    fn update(&mut self, index: usize, node: N) {
        self.remove(index, 1);
        self.insert(index, node);
    }

    /// Whether [`update`](Applier::update) keeps the children of the replaced
    /// node. When it does not, the composition inserts them again. Return
    /// `true` from appliers that override `update` to keep them.
    fn update_keeps_children(&self) -> bool {
        false
    }

    /// Makes the children of the node at `index` the current container.
    fn down(&mut self, index: usize) {
        let _ = index;
    }

    /// Returns to the container that was current before the matching `down`.
    fn up(&mut self) {}
}

/// Moves `count` items starting at `from` so they start at `to` afterwards.
pub fn move_items<T>(items: &mut Vec<T>, from: usize, to: usize, count: usize) {
    if from == to || count == 0 {
        return;
    }
    let moved: Vec<T> = items.drain(from..from + count).collect();
    let tail = items.split_off(to);
    items.extend(moved);
    items.extend(tail);
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryNode<N> {
    pub value: N,
    pub children: Vec<MemoryNode<N>>,
}

/// One call received by a [`MemoryApplier`].
#[derive(Clone, Debug, PartialEq)]
pub enum ApplierOp<N> {
    Insert { index: usize, node: N },
    Remove { index: usize, count: usize },
    Move { from: usize, to: usize, count: usize },
    Update { index: usize, node: N },
    Clear,
    Down(usize),
    Up,
}

/// In-memory node tree. Records every call it receives.
pub struct MemoryApplier<N> {
    roots: Vec<MemoryNode<N>>,
    path: Vec<usize>,
    log: Vec<ApplierOp<N>>,
}

impl<N> Default for MemoryApplier<N> {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            path: Vec::new(),
            log: Vec::new(),
        }
    }
}

impl<N: Clone> MemoryApplier<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roots(&self) -> &[MemoryNode<N>] {
        &self.roots
    }

    /// Values of the top-level nodes, in order.
    pub fn values(&self) -> Vec<N> {
        self.roots.iter().map(|n| n.value.clone()).collect()
    }

    pub fn log(&self) -> &[ApplierOp<N>] {
        &self.log
    }

    pub fn take_log(&mut self) -> Vec<ApplierOp<N>> {
        std::mem::take(&mut self.log)
    }

    fn current(&mut self) -> Option<&mut Vec<MemoryNode<N>>> {
        let mut list = &mut self.roots;
        for &index in &self.path {
            list = &mut list.get_mut(index)?.children;
        }
        Some(list)
    }

    fn with_current(&mut self, f: impl FnOnce(&mut Vec<MemoryNode<N>>)) {
        match self.current() {
            Some(list) => f(list),
            None => log::error!("memory applier: no container at {:?}", self.path),
        }
    }
}

impl<N: fmt::Display> MemoryApplier<N> {
    /// Indented rendering of the tree, one node per line.
    pub fn dump(&self) -> String {
        fn walk<N: fmt::Display>(out: &mut String, nodes: &[MemoryNode<N>], depth: usize) {
            for node in nodes {
                let _ = writeln!(out, "{}{}", "  ".repeat(depth), node.value);
                walk(out, &node.children, depth + 1);
            }
        }
        let mut out = String::new();
        walk(&mut out, &self.roots, 0);
        out
    }
}

impl<N: Clone> Applier<N> for MemoryApplier<N> {
    fn insert(&mut self, index: usize, node: N) {
        self.log.push(ApplierOp::Insert {
            index,
            node: node.clone(),
        });
        self.with_current(|list| {
            list.insert(
                index.min(list.len()),
                MemoryNode {
                    value: node,
                    children: Vec::new(),
                },
            )
        });
    }

    fn remove(&mut self, index: usize, count: usize) {
        self.log.push(ApplierOp::Remove { index, count });
        self.with_current(|list| {
            let end = (index + count).min(list.len());
            list.drain(index.min(end)..end);
        });
    }

    fn move_nodes(&mut self, from: usize, to: usize, count: usize) {
        self.log.push(ApplierOp::Move { from, to, count });
        self.with_current(|list| move_items(list, from, to, count));
    }

    fn clear(&mut self) {
        self.log.push(ApplierOp::Clear);
        self.roots.clear();
        self.path.clear();
    }

    fn update(&mut self, index: usize, node: N) {
        self.log.push(ApplierOp::Update {
            index,
            node: node.clone(),
        });
        self.with_current(|list| {
            if let Some(existing) = list.get_mut(index) {
                existing.value = node;
            }
        });
    }

    fn update_keeps_children(&self) -> bool {
        true
    }

    fn down(&mut self, index: usize) {
        self.log.push(ApplierOp::Down(index));
        self.path.push(index);
    }

    fn up(&mut self) {
        self.log.push(ApplierOp::Up);
        self.path.pop();
    }
}
