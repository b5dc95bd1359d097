//! Arbor Routing Layer
//!
//! The per-daemon view of the control-plane tree: where this daemon sits,
//! who its ancestors and children are, how to take one step toward any
//! other rank, and how to patch all of that up when daemons die.
//!
//! # Design
//!
//! The tree itself is never stored - [`arbor_tree`] recomputes any position
//! from `(radix, N, rank)` on demand. What a [`Router`] holds is only this
//! daemon's *resolved* view: its ancestor chain (root-first), its child
//! slots, its lifeline (immediate parent), and two failure bitsets. All of
//! it is derivable locally at startup; no daemon asks any other daemon
//! where it belongs.
//!
//! # Failure repair
//!
//! When a rank is reported dead, the repair pass rewrites the ancestor
//! chain with promotion rules (a dead ancestor's slot is inherited by the
//! next living rank in a depth-first right-first walk of its subtree),
//! re-derives this daemon's own position when it is the one promoted, and
//! substitutes dead children with their living successors. Each pass
//! produces a [`RecoveryReport`] describing what changed, which feeds the
//! notices to peers and the registered [`RepairHooks`].
//!
//! Repair is idempotent: a rank already known dead is never re-processed,
//! and ranks are never reused within a run.
//!
//! # Ownership
//!
//! `Router` is plain mutable state with no interior locking. Exactly one
//! owner - the daemon's progress context - may mutate it; see
//! `arbor-daemon` for the event loop that enforces this.

mod error;
mod hooks;
mod rankset;
mod repair;
mod report;
mod router;
mod wire;

pub use error::{Error, Result};
pub use hooks::{RepairHook, RepairHooks};
pub use rankset::RankSet;
pub use report::{FaultScope, RecoveryReport};
pub use router::{NextHop, Router, RouterSnapshot};
pub use wire::{AdoptionNotice, FailureNotice};

// Re-export the addressing vocabulary; every consumer of the router needs it.
pub use arbor_tree::{Rank, Tree, TreeNode, RANK_INVALID};
