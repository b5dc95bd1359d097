//! Position arithmetic over the implicit tree.
//!
//! All operations are O(1) or O(depth), allocate nothing, and never touch
//! state outside the node they are handed. The `(radix, n_daemons)` context
//! travels explicitly in a [`Tree`] so the same math can serve any daemon,
//! any rank, any test - there are no process globals.

use crate::node::{Rank, TreeNode, RANK_INVALID};
use crate::walk::{ChildIter, SubtreeRanks};

/// Addressing context: the branching factor and the size of the rank space.
///
/// Both are fixed for the life of a job. `Tree` is `Copy`; pass it around
/// like the pair of integers it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tree {
    radix: u64,
    n_daemons: u64,
}

impl Tree {
    /// Create an addressing context.
    ///
    /// # Panics
    ///
    /// Panics if `radix < 2` (the geometric-sum layer math divides by
    /// `radix - 1`) or if `n_daemons == 0`.
    pub fn new(radix: u64, n_daemons: u64) -> Self {
        assert!(radix >= 2, "radix must be at least 2");
        assert!(n_daemons >= 1, "rank space cannot be empty");
        Self { radix, n_daemons }
    }

    /// The branching factor.
    #[inline]
    pub const fn radix(&self) -> u64 {
        self.radix
    }

    /// Total ranks in the tree.
    #[inline]
    pub const fn n_daemons(&self) -> u64 {
        self.n_daemons
    }

    /// Recompute `rank` from `base` and the current layer via the wrap rule.
    fn update_rank(&self, node: &mut TreeNode) {
        node.rank = RANK_INVALID;
        if node.base >= self.n_daemons {
            return;
        }
        if node.width == 0 || node.count < node.width {
            return;
        }
        let layer_offset = node.count - node.width;
        if node.base < layer_offset {
            return;
        }
        node.rank = (node.base - layer_offset) % node.width + layer_offset;
        if node.rank > node.base {
            node.rank = RANK_INVALID;
        }
    }

    /// Step one layer deeper, updating width/count but not rank.
    fn incr_depth(&self, node: &mut TreeNode) {
        let width = node.width.checked_mul(self.radix);
        let count = width.and_then(|w| node.count.checked_add(w));
        match (width, count) {
            (Some(w), Some(c)) if node.depth < RANK_INVALID => {
                node.depth += 1;
                node.width = w;
                node.count = c;
            }
            _ => node.invalidate(),
        }
    }

    /// Step one layer shallower, updating width/count but not rank.
    fn decr_depth(&self, node: &mut TreeNode) {
        if node.depth == 0 || node.depth == RANK_INVALID {
            node.invalidate();
            return;
        }
        node.depth -= 1;
        node.count -= node.width;
        node.width /= self.radix;
    }

    /// The tree position a rank occupies in its own layer.
    ///
    /// Depth is found by inverting the geometric sum: walk the layer counts
    /// up until the cumulative count passes the rank. Depth is bounded by
    /// `log_radix(N)`, so the search is a handful of multiplies.
    pub fn node(&self, rank: Rank) -> TreeNode {
        let mut node = TreeNode {
            rank: RANK_INVALID,
            base: rank,
            depth: 0,
            width: 1,
            count: 1,
        };
        if rank >= self.n_daemons {
            node.base = RANK_INVALID;
            return node;
        }
        while node.count <= rank {
            self.incr_depth(&mut node);
        }
        node.rank = rank;
        node
    }

    /// Raise the node one layer, keeping `base` as the identity anchor.
    /// The root's parent does not exist; the result is invalid there.
    pub fn to_parent(&self, node: &mut TreeNode) {
        self.decr_depth(node);
        self.update_rank(node);
    }

    /// As [`to_parent`](Self::to_parent), but returns a fresh node rebased
    /// onto the parent's own rank.
    pub fn parent(&self, node: &TreeNode) -> TreeNode {
        let mut parent = *node;
        self.to_parent(&mut parent);
        parent.base = parent.rank;
        parent
    }

    /// The `idx`-th child of this position; subsequent children carry higher
    /// base ranks. Invalid when the child slot falls outside `[0, N)`.
    pub fn child(&self, node: &TreeNode, idx: u64) -> TreeNode {
        let mut child = *node;
        self.incr_depth(&mut child);
        if idx >= self.radix || node.rank >= self.n_daemons {
            child.base = RANK_INVALID;
        } else {
            child.base = node.rank + node.width * (idx + 1);
        }
        self.update_rank(&mut child);
        child
    }

    /// Given the `i`-th child of some node, its `i+1`-th sibling. The step
    /// is the parent's width. Invalid once it would leave the layer.
    pub fn right_sibling(&self, node: &TreeNode) -> TreeNode {
        let mut sibling = *node;
        if node.rank >= self.n_daemons {
            sibling.base = RANK_INVALID;
        } else {
            sibling.base = node.rank + node.width / self.radix;
            if sibling.base >= node.count {
                sibling.base = RANK_INVALID;
            }
        }
        self.update_rank(&mut sibling);
        sibling
    }

    /// Move the node to a target depth, recomputing its rank there.
    ///
    /// Invalid if a tree of `n_daemons` ranks cannot have a fully populated
    /// layer above depth `d` - i.e. the parent layer alone would need more
    /// slots than exist.
    pub fn to_depth(&self, node: &mut TreeNode, depth: u64) {
        let mut width: u64 = 1;
        let mut count: u64 = 1;
        for _ in 0..depth {
            width = width.saturating_mul(self.radix);
            count = count.saturating_add(width);
            if count / self.radix > self.n_daemons {
                node.invalidate();
                return;
            }
        }
        node.depth = depth;
        node.width = width;
        node.count = count;
        self.update_rank(node);
    }

    /// As [`to_depth`](Self::to_depth), returning a fresh node.
    pub fn at_depth(&self, node: &TreeNode, depth: u64) -> TreeNode {
        let mut ret = *node;
        self.to_depth(&mut ret, depth);
        ret
    }

    /// Step to the next position in a depth-first, right-first traversal.
    ///
    /// Descends into the rightmost in-range child when one exists; otherwise
    /// climbs until a layer with an unvisited left-hand neighbour, then steps
    /// to it. `base` follows `rank`: traversal rebases at every step. The
    /// walk ends on an invalid node.
    pub fn to_next(&self, node: &mut TreeNode) {
        if node.rank >= self.n_daemons {
            node.rank = RANK_INVALID;
        } else if node.rank + node.width < self.n_daemons {
            // Node has at least one child
            let mut child = node.rank + node.width * self.radix;
            while child >= self.n_daemons {
                child -= node.width;
            }
            self.incr_depth(node);
            node.rank = child;
        } else {
            // Node has no children; work back up the tree until a valid
            // left-hand position exists at some layer
            loop {
                if node.depth == 0 {
                    node.invalidate();
                    node.base = RANK_INVALID;
                    return;
                }
                self.decr_depth(node);
                node.rank = node.rank.wrapping_sub(node.width);
                if node.rank >= node.count {
                    break;
                }
            }
            self.incr_depth(node);
            if node.rank == 0 || node.rank >= self.n_daemons {
                node.rank = RANK_INVALID;
            }
        }
        node.base = node.rank;
    }

    /// Whether a rank names a live daemon under the given failure predicate.
    #[inline]
    pub fn is_living<F>(&self, rank: Rank, is_failed: &F) -> bool
    where
        F: Fn(Rank) -> bool,
    {
        rank < self.n_daemons && !is_failed(rank)
    }

    /// As [`to_next`](Self::to_next), but keeps stepping until a living rank
    /// is found or the traversal is exhausted.
    pub fn to_next_living<F>(&self, node: &mut TreeNode, is_failed: &F)
    where
        F: Fn(Rank) -> bool,
    {
        loop {
            if node.rank >= self.n_daemons {
                node.rank = RANK_INVALID;
                node.base = RANK_INVALID;
                return;
            }
            self.to_next(node);
            if self.is_living(node.rank, is_failed) {
                return;
            }
        }
    }

    /// As [`to_next_living`](Self::to_next_living), but only accepts
    /// positions inside `root`'s subtree; anything else ends the walk.
    pub fn rooted_to_next_living<F>(&self, root: TreeNode, node: &mut TreeNode, is_failed: &F)
    where
        F: Fn(Rank) -> bool,
    {
        self.to_next_living(node, is_failed);
        if !self.subtree_contains(&root, node.rank) {
            node.rank = RANK_INVALID;
            node.base = RANK_INVALID;
        }
    }

    /// The next living occupant of `root`'s subtree after `node`, as a
    /// fresh value.
    pub fn rooted_next_living<F>(&self, root: TreeNode, node: &TreeNode, is_failed: &F) -> TreeNode
    where
        F: Fn(Rank) -> bool,
    {
        let mut ret = *node;
        self.rooted_to_next_living(root, &mut ret, is_failed);
        ret
    }

    /// True iff `rank` lies at or below `root` under the wrap rule.
    pub fn subtree_contains(&self, root: &TreeNode, rank: Rank) -> bool {
        if rank >= self.n_daemons {
            return false;
        }
        if rank < root.rank {
            return false;
        }
        let layer_offset = root.count - root.width;
        root.rank == (rank - layer_offset) % root.width + layer_offset
    }

    /// Which of `node`'s child subtrees contains `rank`. `None` if `rank`
    /// is `node` itself or outside its subtree.
    pub fn subtree_index(&self, node: &TreeNode, rank: Rank) -> Option<usize> {
        if rank == node.rank || !self.subtree_contains(node, rank) {
            return None;
        }
        let child_width = node.width * self.radix;
        // Simplified from:
        //   child_rank = (rank - count) % child_width + count
        //   child_index = (child_rank - count) / width
        Some((((rank - node.count) % child_width) / node.width) as usize)
    }

    /// Iterate this node's in-range children, leftmost first.
    pub fn children(&self, node: &TreeNode) -> ChildIter {
        ChildIter::new(*self, self.child(node, 0))
    }

    /// Iterate every rank in this node's subtree, in rank order.
    pub fn subtree_ranks(&self, node: &TreeNode) -> SubtreeRanks {
        SubtreeRanks::new(node, self.n_daemons)
    }

    /// Full internal-consistency check of a node against this context.
    /// Test and debug helper; the hot paths rely on the invariants instead
    /// of rechecking them.
    pub fn is_consistent(&self, node: &TreeNode) -> bool {
        if node.base >= self.n_daemons {
            return false;
        }
        if node.rank >= self.n_daemons || node.rank > node.base || node.rank >= node.count {
            return false;
        }
        if node.depth > self.n_daemons {
            return false;
        }
        if node.width == 0 || node.count == 0 {
            return false;
        }
        if node.count / self.radix > self.n_daemons {
            return false;
        }
        if node.count < node.width {
            return false;
        }

        let layer_offset = node.count - node.width;
        if node.base < layer_offset {
            return false;
        }
        if node.rank != (node.base - layer_offset) % node.width + layer_offset {
            return false;
        }
        if node.count != (node.width * self.radix - 1) / (self.radix - 1) {
            return false;
        }

        // width must be an exact power of the radix matching depth
        let mut depth = node.depth;
        let mut width = node.width;
        while width >= self.radix && depth > 0 {
            if width % self.radix != 0 {
                return false;
            }
            width /= self.radix;
            depth -= 1;
        }
        depth == 0 && width == 1
    }
}
