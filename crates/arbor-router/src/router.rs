//! Per-daemon routing table and route resolution.

use arbor_tree::{Rank, Tree, TreeNode, RANK_INVALID};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::rankset::RankSet;

/// Where one step toward a target leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// The target is this daemon; no forwarding.
    Deliver,
    /// Forward to this directly-connected rank.
    Forward(Rank),
    /// No live path right now. Either the target's subtree lost its entry
    /// point and repair has not replaced it yet, or the target is dead.
    Unreachable,
}

impl NextHop {
    /// The forwarding rank, if any.
    pub fn rank(&self) -> Option<Rank> {
        match self {
            NextHop::Forward(r) => Some(*r),
            _ => None,
        }
    }
}

/// A point-in-time copy of a router's resolved view, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSnapshot {
    pub rank: Rank,
    pub depth: u64,
    pub parent: Option<Rank>,
    pub ancestors: Vec<Rank>,
    pub children: Vec<Rank>,
    pub failed: Vec<Rank>,
    pub globally_failed: Vec<Rank>,
}

/// One daemon's place in the control-plane tree.
///
/// Everything here is derived from `(N, radix, my_rank)` at construction;
/// only the failure-repair pass mutates it afterwards. The struct is not
/// internally synchronized - it belongs to exactly one progress context.
#[derive(Debug)]
pub struct Router {
    pub(crate) tree: Tree,
    pub(crate) my_rank: Rank,
    /// This daemon's current position; depth shrinks on promotion.
    pub(crate) me: TreeNode,
    /// Root-first; the last entry is the lifeline.
    pub(crate) ancestors: Vec<Rank>,
    /// Indexed by subtree index; `RANK_INVALID` marks an emptied slot.
    /// Trailing empties are trimmed.
    pub(crate) children: Vec<Rank>,
    pub(crate) lifeline: Rank,
    pub(crate) n_children: usize,
    /// Ranks this daemon believes dead.
    pub(crate) failed: RankSet,
    /// Subset of `failed` acknowledged tree-wide by the root.
    pub(crate) global_failed: RankSet,
    /// Deliberate shutdown: lost children are bookkeeping, not faults.
    pub(crate) finalizing: bool,
}

impl Router {
    /// Derive the routing table for `my_rank` in a job of `n_daemons`.
    ///
    /// Needs nothing but the three integers: ancestors come from depth
    /// jumps along this rank's own path and children from the child
    /// iterator, so any daemon computes its own table without contacting
    /// anyone.
    pub fn new(n_daemons: u64, radix: u64, my_rank: Rank) -> Result<Self> {
        if radix < 2 {
            return Err(Error::InvalidRadix(radix));
        }
        if n_daemons == 0 || my_rank >= n_daemons {
            return Err(Error::InvalidRank {
                rank: my_rank,
                n_daemons,
            });
        }

        let tree = Tree::new(radix, n_daemons);
        let me = tree.node(my_rank);

        let mut ancestors = Vec::with_capacity(me.depth as usize);
        for d in 0..me.depth {
            ancestors.push(tree.at_depth(&me, d).rank);
        }
        let lifeline = ancestors.last().copied().unwrap_or(RANK_INVALID);

        let children: Vec<Rank> = tree.children(&me).map(|c| c.rank).collect();
        let n_children = children.len();

        debug!(
            rank = my_rank,
            depth = me.depth,
            parent = ?ancestors.last(),
            n_children,
            "computed routing tree"
        );
        trace!(?ancestors, ?children, "routing tree detail");

        Ok(Self {
            tree,
            my_rank,
            me,
            ancestors,
            children,
            lifeline,
            n_children,
            failed: RankSet::new(n_daemons),
            global_failed: RankSet::new(n_daemons),
            finalizing: false,
        })
    }

    /// The addressing context.
    pub fn tree(&self) -> Tree {
        self.tree
    }

    /// This daemon's rank.
    pub fn my_rank(&self) -> Rank {
        self.my_rank
    }

    /// This daemon's current depth. Only ever decreases.
    pub fn depth(&self) -> u64 {
        self.me.depth
    }

    /// Whether this daemon currently occupies the root position.
    pub fn is_root(&self) -> bool {
        self.me.depth == 0
    }

    /// The ancestor chain, root-first, ending at the lifeline.
    pub fn ancestors(&self) -> &[Rank] {
        &self.ancestors
    }

    /// The immediate parent, `None` at the root.
    pub fn parent(&self) -> Option<Rank> {
        (self.lifeline != RANK_INVALID).then_some(self.lifeline)
    }

    /// The live child ranks, in subtree-index order.
    pub fn children(&self) -> impl Iterator<Item = Rank> + '_ {
        self.children.iter().copied().filter(|&r| r != RANK_INVALID)
    }

    /// Raw child slots including emptied holes, for index-aligned diffing.
    pub fn child_slots(&self) -> &[Rank] {
        &self.children
    }

    /// Current fan-out.
    pub fn n_children(&self) -> usize {
        self.n_children
    }

    /// Whether this daemon believes `rank` is dead.
    pub fn is_failed(&self, rank: Rank) -> bool {
        self.failed.contains(rank)
    }

    /// Whether the root has announced `rank`'s failure tree-wide.
    pub fn is_globally_failed(&self, rank: Rank) -> bool {
        self.global_failed.contains(rank)
    }

    /// Enter deliberate shutdown; subsequent lost child links are plain
    /// bookkeeping rather than faults.
    pub fn begin_shutdown(&mut self) {
        self.finalizing = true;
    }

    /// Resolve one step toward `target`.
    ///
    /// Every rank outside this daemon's subtree is reachable only through
    /// an ancestor, so those forward to the lifeline. Ranks inside forward
    /// to the child subtree that contains them; if that slot is currently
    /// empty the destination is unreachable until a repair lands.
    ///
    /// Pure arithmetic over local state - O(1), no allocation, no
    /// communication.
    pub fn next_hop(&self, target: Rank) -> NextHop {
        let hop = if target >= self.tree.n_daemons() {
            NextHop::Unreachable
        } else if target == self.my_rank {
            NextHop::Deliver
        } else if !self.tree.subtree_contains(&self.me, target) {
            if self.lifeline == RANK_INVALID {
                NextHop::Unreachable
            } else {
                NextHop::Forward(self.lifeline)
            }
        } else {
            match self.tree.subtree_index(&self.me, target) {
                Some(idx) if idx < self.children.len() && self.children[idx] != RANK_INVALID => {
                    NextHop::Forward(self.children[idx])
                }
                // The entry point to that subtree failed and has not been
                // replaced yet
                _ => NextHop::Unreachable,
            }
        };
        trace!(target, ?hop, "resolved next hop");
        hop
    }

    /// How many distinct child subtrees hold at least one live rank from
    /// `ranks`. Group-collective dependents use this to count expected
    /// contributions from below.
    pub fn num_contributing_children(&self, ranks: &[Rank]) -> usize {
        let mut contributing = vec![false; self.children.len()];
        for &rank in ranks {
            if self.failed.contains(rank) {
                continue;
            }
            if let Some(idx) = self.tree.subtree_index(&self.me, rank) {
                if idx < contributing.len() {
                    contributing[idx] = true;
                }
            }
        }
        contributing.into_iter().filter(|&b| b).count()
    }

    /// Failures in this daemon's subtree the root has not yet acknowledged.
    /// Reported wholesale to a *new* parent, which may have missed them.
    pub fn unacknowledged_subtree_failures(&self) -> Vec<Rank> {
        self.failed
            .iter()
            .filter(|&r| !self.global_failed.contains(r))
            .filter(|&r| self.tree.subtree_contains(&self.me, r))
            .collect()
    }

    /// Filter `ranks` down to those inside this daemon's subtree.
    pub fn subtree_failures(&self, ranks: &[Rank]) -> Vec<Rank> {
        ranks
            .iter()
            .copied()
            .filter(|&r| self.tree.subtree_contains(&self.me, r))
            .collect()
    }

    /// Mark ranks as globally acknowledged. The root does this as it
    /// broadcasts a confirmation, so its own later passes do not re-report
    /// them upward.
    pub fn acknowledge_global(&mut self, ranks: &[Rank]) {
        for &r in ranks {
            self.global_failed.set(r);
        }
    }

    /// Copy out the resolved view for inspection or verbose dumps.
    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            rank: self.my_rank,
            depth: self.me.depth,
            parent: self.parent(),
            ancestors: self.ancestors.clone(),
            children: self.children().collect(),
            failed: self.failed.iter().collect(),
            globally_failed: self.global_failed.iter().collect(),
        }
    }
}

/// Trim trailing empty slots, keeping live entries at their index.
pub(crate) fn shrink_ranks(ranks: &mut Vec<Rank>) {
    while ranks.last() == Some(&RANK_INVALID) {
        ranks.pop();
    }
}
