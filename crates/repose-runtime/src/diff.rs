//! Keyed positional diff between two child lists.
//!
//! Common prefixes and suffixes are trimmed first, so edits at the ends cost
//! O(n). In the changed middle, kept items on a longest increasing run of old
//! positions stay where they are and every other kept item moves once, which
//! is the fewest moves possible. That part is O(m log m) for a middle of `m`
//! items.
//!
//! Removals come first (back to front, so earlier indices stay valid). Moves
//! and inserts then walk the new list from the back. Replaying the ops on the
//! old list yields the new one.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffOp {
    Remove { index: usize, count: usize },
    /// Insert `new[source]` at `index`.
    Insert { index: usize, source: usize },
    /// Move one item so it ends up at `to`.
    Move { from: usize, to: usize },
}

/// Presence counts over a fixed, ordered set of slots.
struct Fenwick {
    tree: Vec<usize>,
}

impl Fenwick {
    fn new(len: usize) -> Self {
        Self {
            tree: vec![0; len + 1],
        }
    }

    fn insert(&mut self, slot: usize) {
        let mut i = slot + 1;
        while i < self.tree.len() {
            self.tree[i] += 1;
            i += i & i.wrapping_neg();
        }
    }

    fn remove(&mut self, slot: usize) {
        let mut i = slot + 1;
        while i < self.tree.len() {
            self.tree[i] -= 1;
            i += i & i.wrapping_neg();
        }
    }

    /// Present slots below `slot`.
    fn before(&self, slot: usize) -> usize {
        let mut sum = 0;
        let mut i = slot;
        while i > 0 {
            sum += self.tree[i];
            i -= i & i.wrapping_neg();
        }
        sum
    }
}

/// Marks one longest strictly increasing subsequence of `seq`.
fn longest_increasing(seq: &[usize]) -> Vec<bool> {
    // tails[k]: index of the smallest last value of a run of length k + 1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev = vec![None; seq.len()];
    for (i, &value) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < value);
        if k > 0 {
            prev[i] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(i);
        } else {
            tails[k] = i;
        }
    }
    let mut marked = vec![false; seq.len()];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        marked[i] = true;
        cursor = prev[i];
    }
    marked
}

pub fn keyed_diff<K: Eq + Hash>(old: &[K], new: &[K]) -> Vec<DiffOp> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    if old_mid.is_empty() && new_mid.is_empty() {
        return Vec::new();
    }

    // Duplicate keys pair up in order of appearance.
    let mut positions: HashMap<&K, VecDeque<usize>> = HashMap::new();
    for (j, key) in new_mid.iter().enumerate() {
        positions.entry(key).or_default().push_back(j);
    }
    let target: Vec<Option<usize>> = old_mid
        .iter()
        .map(|key| positions.get_mut(key).and_then(|q| q.pop_front()))
        .collect();

    let mut ops = Vec::new();
    let mut i = old_mid.len();
    while i > 0 {
        if target[i - 1].is_some() {
            i -= 1;
            continue;
        }
        let end = i;
        while i > 0 && target[i - 1].is_none() {
            i -= 1;
        }
        ops.push(DiffOp::Remove {
            index: prefix + i,
            count: end - i,
        });
    }

    // Kept items by rank (old order), with their new positions.
    let placed: Vec<usize> = target.iter().flatten().copied().collect();
    let kept = placed.len();
    let stable = longest_increasing(&placed);
    let mut rank_of = vec![None; new_mid.len()];
    for (rank, &j) in placed.iter().enumerate() {
        rank_of[j] = Some(rank);
    }
    let is_stable = |j: usize| rank_of[j].is_some_and(|rank: usize| stable[rank]);

    // An item placed at `j` lands right before the next stable item of the
    // new list, or at the end of the middle. `anchor[j]` is that item's rank.
    let mut anchor = vec![kept; new_mid.len()];
    for j in (0..new_mid.len().saturating_sub(1)).rev() {
        anchor[j] = match rank_of[j + 1] {
            Some(rank) if stable[rank] => rank,
            _ => anchor[j + 1],
        };
    }

    // Sort keys giving the relative order of everything in the list: a kept
    // item not yet moved is `(rank, 1, 0)`, an item placed at `j` is
    // `(anchor[j], 0, j)`.
    let mut keys: Vec<(usize, u8, usize)> = (0..kept).map(|rank| (rank, 1, 0)).collect();
    keys.extend(
        (0..new_mid.len())
            .filter(|&j| !is_stable(j))
            .map(|j| (anchor[j], 0, j)),
    );
    keys.sort_unstable();
    let slot = |key: (usize, u8, usize)| keys.binary_search(&key).unwrap_or_else(|at| at);

    let mut present = Fenwick::new(keys.len());
    for rank in 0..kept {
        present.insert(slot((rank, 1, 0)));
    }

    for j in (0..new_mid.len()).rev() {
        let at = slot((anchor[j], 0, j));
        match rank_of[j] {
            Some(rank) if stable[rank] => {}
            Some(rank) => {
                let from = slot((rank, 1, 0));
                let index = present.before(from);
                present.remove(from);
                ops.push(DiffOp::Move {
                    from: prefix + index,
                    to: prefix + present.before(at),
                });
                present.insert(at);
            }
            None => {
                ops.push(DiffOp::Insert {
                    index: prefix + present.before(at),
                    source: prefix + j,
                });
                present.insert(at);
            }
        }
    }
    ops
}
