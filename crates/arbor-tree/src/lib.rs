//! Arbor Tree Addressing
//!
//! Implicit k-ary tree addressing over a dense daemon rank space.
//!
//! # Mathematical Foundation
//!
//! Every daemon in an Arbor job carries a dense integer rank in `[0, N)`.
//! Those ranks are embedded into an R-ary tree without storing the tree
//! anywhere: a rank's position is fully determined by the branching factor
//! (the *radix*), the total daemon count, and the rank itself.
//!
//! A layer at depth `d` spans `width = R^d` logical slots, and the slots
//! from the root through depth `d` number `count = (width·R − 1)/(R − 1)`,
//! the geometric sum. A rank `b` occupies the slot
//!
//! ```text
//! rank = (b − layer_offset) mod width + layer_offset,   layer_offset = count − width
//! ```
//!
//! at the unique depth whose layer contains `b`. The wrap-around rule lets a
//! rank space of *any* size fit a tree whose deepest layer is only partially
//! populated, and it makes every position recomputable on demand - no node
//! objects, no synchronization, no storage beyond five integers.
//!
//! # Usage
//!
//! [`Tree`] holds the `(radix, n_daemons)` context and provides the position
//! arithmetic: parent/child/sibling movement, depth jumps, depth-first
//! right-first traversal, and subtree containment tests. [`TreeNode`] is the
//! plain value type those operations produce and consume.

mod node;
mod tree;
mod walk;

pub use node::{Rank, TreeNode, RANK_INVALID};
pub use tree::Tree;
pub use walk::{ChildIter, SubtreeRanks};
