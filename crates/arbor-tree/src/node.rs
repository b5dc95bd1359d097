//! Tree position value type.
//!
//! A [`TreeNode`] is five integers and nothing else. Positions are computed
//! on demand from [`Tree`](crate::Tree) operations and thrown away freely;
//! there is no allocated tree anywhere.

/// A daemon rank - a dense integer in `[0, N)`.
pub type Rank = u64;

/// Sentinel for "no such rank": an unused slot, a missing parent, a failed
/// lookup. Never a valid position.
pub const RANK_INVALID: Rank = u64::MAX;

/// A logical position in the implicit k-ary tree.
///
/// `base` is the rank this position was derived from and anchors the node's
/// identity across depth changes: moving a node up or down a layer keeps
/// `base` fixed and recomputes `rank` from it via the wrap rule. The two
/// differ exactly when the node describes an *ancestor slot* of `base`
/// rather than `base` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeNode {
    /// Rank occupying this position (may differ from `base` after a depth
    /// change). `RANK_INVALID` when the position does not exist.
    pub rank: Rank,
    /// The rank this position was derived from.
    pub base: Rank,
    /// Distance from the root (root = 0).
    pub depth: u64,
    /// Slots in this node's layer: `radix^depth`.
    pub width: u64,
    /// Slots from the root through this layer, inclusive.
    pub count: u64,
}

impl TreeNode {
    /// A position that exists nowhere.
    pub const INVALID: Self = Self {
        rank: RANK_INVALID,
        base: RANK_INVALID,
        depth: 0,
        width: 1,
        count: 1,
    };

    /// Whether this node names a real position.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.rank != RANK_INVALID
    }

    /// First slot of this node's layer.
    #[inline]
    pub const fn layer_offset(&self) -> u64 {
        self.count - self.width
    }

    /// Mark this node as naming no position. Depth bookkeeping is poisoned
    /// so any later rank recomputation also comes out invalid.
    #[inline]
    pub(crate) fn invalidate(&mut self) {
        self.rank = RANK_INVALID;
        self.depth = RANK_INVALID;
        self.width = 0;
        self.count = 0;
    }
}

impl Default for TreeNode {
    fn default() -> Self {
        Self::INVALID
    }
}

impl std::fmt::Display for TreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "rank {} (depth {})", self.rank, self.depth)
        } else {
            write!(f, "rank <invalid>")
        }
    }
}
