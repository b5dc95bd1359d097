//! Recovery reports handed to dependents after a repair pass.

use arbor_tree::{Rank, RANK_INVALID};

/// How widely a failure is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScope {
    /// Discovered by, or propagated to, this daemon's subtree only.
    Local,
    /// Announced by the root; the whole tree has been told.
    Global,
}

/// One repair pass's worth of change, snapshotted for dependents.
///
/// Dependents use the `prev_*` snapshots to purge per-peer state for ranks
/// that moved or died, and the change flags to skip work when nothing they
/// care about moved. A `Global` report carries no tree deltas - the local
/// pass that preceded it already did - and serves as the tree-wide
/// acknowledgement of the listed failures.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Ranks newly confirmed dead in this pass.
    pub failed: Vec<Rank>,
    /// Whether this pass was local discovery or a root announcement.
    pub scope: FaultScope,

    /// Ancestor chain before the pass, root-first.
    pub prev_ancestors: Vec<Rank>,
    /// Child slots before the pass. Padded with `RANK_INVALID` up to the
    /// new child count so dependents can always iterate the longer of the
    /// two shapes by index.
    pub prev_children: Vec<Rank>,
    /// Lifeline before the pass; `None` at the root.
    pub prev_parent: Option<Rank>,

    /// Whether the ancestor chain changed.
    pub ancestors_changed: bool,
    /// Whether the lifeline changed.
    pub parent_changed: bool,
    /// Whether any child slot changed.
    pub children_changed: bool,
    /// Whether this daemon's own depth decreased - it now occupies a former
    /// ancestor's slot.
    pub promoted: bool,
}

impl RecoveryReport {
    /// Whether anything about this daemon's position or links moved.
    pub fn tree_changed(&self) -> bool {
        self.ancestors_changed || self.parent_changed || self.children_changed || self.promoted
    }

    /// The previous child slots that held a real rank.
    pub fn prev_live_children(&self) -> impl Iterator<Item = Rank> + '_ {
        self.prev_children
            .iter()
            .copied()
            .filter(|&r| r != RANK_INVALID)
    }
}
