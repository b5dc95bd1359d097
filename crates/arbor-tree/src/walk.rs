//! Iterators over children and subtree rank spans.

use crate::node::{Rank, TreeNode};
use crate::tree::Tree;

/// Iterates a node's in-range children, leftmost first.
///
/// Produced by [`Tree::children`]. Each step is a sibling move; the walk
/// ends at the first out-of-range slot.
pub struct ChildIter {
    tree: Tree,
    next: TreeNode,
}

impl ChildIter {
    pub(crate) fn new(tree: Tree, first: TreeNode) -> Self {
        Self { tree, next: first }
    }
}

impl Iterator for ChildIter {
    type Item = TreeNode;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.next.is_valid() {
            return None;
        }
        let current = self.next;
        self.next = self.tree.right_sibling(&current);
        Some(current)
    }
}

/// Iterates every rank in a node's subtree, in ascending rank order.
///
/// The wrap rule makes this a stride: the subtree of a node with layer
/// width `w` is exactly the ranks congruent to it modulo `w`, so the whole
/// span is `rank, rank + w, rank + 2w, ...` up to `N`.
pub struct SubtreeRanks {
    next: Rank,
    step: u64,
    limit: u64,
}

impl SubtreeRanks {
    pub(crate) fn new(node: &TreeNode, n_daemons: u64) -> Self {
        if node.is_valid() {
            Self {
                next: node.rank,
                step: node.width,
                limit: n_daemons,
            }
        } else {
            // Empty iterator
            Self {
                next: 0,
                step: 1,
                limit: 0,
            }
        }
    }
}

impl Iterator for SubtreeRanks {
    type Item = Rank;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.limit {
            return None;
        }
        let current = self.next;
        self.next = self.next.saturating_add(self.step);
        Some(current)
    }
}
