//! Failure repair: ancestor recomputation, promotion, child replacement,
//! and adoption-notice reconciliation.
//!
//! Everything here is a deterministic function of `(N, radix, my_rank)`
//! plus the set of ranks believed dead. Two daemons with the same failure
//! knowledge always derive the same tree, which is what lets repairs
//! converge through idempotent notice exchange instead of agreement
//! rounds.

use arbor_tree::{Rank, RANK_INVALID};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::report::{FaultScope, RecoveryReport};
use crate::router::{shrink_ranks, Router};

impl Router {
    /// Rewrite an ancestor chain after failures, top-down.
    ///
    /// Each dead entry is replaced by the next living rank in a depth-first
    /// right-first walk from its position - that rank inherits the slot. A
    /// hole (`RANK_INVALID`) means the entry above was itself promoted from
    /// deeper down, so the hole takes that ancestor's next inheritor. When
    /// the walk lands on this daemon itself, the chain ends there: this
    /// daemon has been promoted into that slot.
    ///
    /// Operates on any candidate chain for this daemon's position - its own
    /// table during repair, or a peer-reported chain during reconciliation.
    pub(crate) fn update_chain(&self, chain: &mut Vec<Rank>) {
        let failed = &self.failed;
        let is_failed = |r: Rank| failed.contains(r);

        let mut prev = self.tree.node(0);
        let mut i = 1;
        while i < chain.len() {
            let mut anc = self.tree.node(chain[i]);
            if !anc.is_valid() {
                // Hole: the previous ancestor was promoted past this depth,
                // so this slot goes to its next inheritor
                anc = prev;
                self.tree.to_next_living(&mut anc, &is_failed);
            } else if is_failed(anc.rank) {
                self.tree.to_next_living(&mut anc, &is_failed);
            }

            if anc.rank == self.my_rank {
                // I'm next in line: promoted, with fewer ancestors
                chain.truncate(i);
                break;
            }
            if anc.rank == chain[i] {
                // No change to this ancestor
                prev = anc;
                i += 1;
                continue;
            }

            chain[i] = anc.rank;
            prev = anc;

            // If this inheritor rose from inside my own path, the entries
            // it passed on the way up are stale
            for j in (i + 1)..chain.len() {
                let virt = self.tree.at_depth(&self.me, j as u64);
                if !self.tree.subtree_contains(&virt, anc.rank) {
                    // Came from a different subtree at this depth
                    break;
                }
                if chain[j] == anc.rank {
                    chain[j] = RANK_INVALID;
                    break;
                }
                chain[j] = RANK_INVALID;
            }
            i += 1;
        }

        shrink_ranks(chain);
    }

    /// Re-derive this daemon's own ancestors and lifeline.
    fn update_ancestors(&mut self) {
        let mut chain = std::mem::take(&mut self.ancestors);
        self.update_chain(&mut chain);
        self.ancestors = chain;
        self.lifeline = self.ancestors.last().copied().unwrap_or(RANK_INVALID);
    }

    /// If the ancestor chain shortened, this daemon now occupies a former
    /// ancestor's slot: move `me` up and rebuild the child slots from the
    /// new position. The slot this daemon used to hang under is filled by
    /// its own next living successor inside that subtree.
    fn handle_promotion(&mut self) {
        let depth = self.ancestors.len() as u64;
        if depth == self.me.depth {
            return;
        }
        debug!(
            rank = self.my_rank,
            from = self.me.depth,
            to = depth,
            "promoted to a shallower position"
        );

        let radix = self.tree.radix() as usize;
        self.children.clear();
        self.children.resize(radix, RANK_INVALID);

        let tree = self.tree;
        tree.to_depth(&mut self.me, depth);
        let old_subtree = tree.at_depth(&self.me, depth + 1);

        let failed = &self.failed;
        let is_failed = |r: Rank| failed.contains(r);

        let mut idx = 0;
        for child in tree.children(&self.me) {
            if child.rank == old_subtree.rank {
                let me_node = tree.node(self.my_rank);
                let succ = tree.rooted_next_living(old_subtree, &me_node, &is_failed);
                self.children[idx] = succ.rank;
                // Nothing lives to the right of my old slot, or the
                // promotion would have gone there instead
                break;
            }
            self.children[idx] = child.rank;
            idx += 1;
        }
    }

    /// Replace dead child entries with the next living occupant of their
    /// subtree; drop them when the whole subtree is gone.
    fn update_descendants(&mut self) {
        self.n_children = 0;
        let tree = self.tree;
        for i in 0..self.children.len() {
            let rank = self.children[i];
            if rank == RANK_INVALID {
                continue;
            }
            if self.failed.contains(rank) {
                let dead = tree.node(rank);
                let failed = &self.failed;
                let succ = tree.rooted_next_living(dead, &dead, &|r| failed.contains(r));
                self.children[i] = succ.rank;
                if !succ.is_valid() {
                    continue;
                }
            }
            self.n_children += 1;
        }
        shrink_ranks(&mut self.children);
    }

    /// Process a set of failed ranks.
    ///
    /// Ranks already known dead are filtered out, so duplicate notices are
    /// no-ops; when nothing new remains, no report is produced. A `Global`
    /// scope marks the ranks globally acknowledged *first* (so the local
    /// pass does not re-report them up the tree), runs the local pass, and
    /// then appends a change-free `Global` report - the acknowledgement
    /// dependents see.
    ///
    /// Returns one report per pass that had fresh information, local pass
    /// first.
    pub fn repair(
        &mut self,
        failed_ranks: &[Rank],
        scope: FaultScope,
    ) -> Result<Vec<RecoveryReport>> {
        let mut reports = Vec::new();
        if scope == FaultScope::Global {
            self.acknowledge_global(failed_ranks);
            reports.extend(self.repair(failed_ranks, FaultScope::Local)?);
        }

        let prev_ancestors = self.ancestors.clone();
        let prev_parent = self.lifeline;
        let mut prev_children = self.children.clone();

        let mut fresh = Vec::with_capacity(failed_ranks.len());
        for &rank in failed_ranks {
            if rank >= self.tree.n_daemons() {
                continue;
            }
            if rank == 0 {
                warn!("failure reported for the root daemon");
                return Err(Error::RootFailed);
            }
            if scope == FaultScope::Local {
                if self.failed.contains(rank) {
                    // Never notify twice for the same rank
                    continue;
                }
                self.failed.set(rank);
            }
            fresh.push(rank);
        }
        if fresh.is_empty() {
            return Ok(reports);
        }

        if scope == FaultScope::Local {
            // The global pass skips this; the local pass just above it
            // already rebuilt the tree
            self.update_ancestors();
            self.handle_promotion();
            self.update_descendants();
        }

        let ancestors_changed = prev_ancestors != self.ancestors;
        let parent_changed = prev_parent != self.lifeline;
        let children_changed = prev_children != self.children;
        let promoted = prev_ancestors.len() > self.ancestors.len();
        if prev_children.len() < self.children.len() {
            // Let report consumers iterate either shape by index
            prev_children.resize(self.children.len(), RANK_INVALID);
        }

        debug!(
            ?fresh,
            ?scope,
            ancestors_changed,
            parent_changed,
            children_changed,
            promoted,
            "repair pass complete"
        );
        trace!(ancestors = ?self.ancestors, children = ?self.children, "post-repair tree");

        reports.push(RecoveryReport {
            failed: fresh,
            scope,
            prev_ancestors,
            prev_children,
            prev_parent: (prev_parent != RANK_INVALID).then_some(prev_parent),
            ancestors_changed,
            parent_changed,
            children_changed,
            promoted,
        });
        Ok(reports)
    }

    /// React to a lost direct connection.
    ///
    /// During deliberate shutdown a vanished child is just bookkeeping.
    /// Losing the link toward the root is fatal - every path out of this
    /// subtree runs through it. Anything else is a local failure event.
    pub fn route_lost(&mut self, route: Rank) -> Result<Vec<RecoveryReport>> {
        if self.finalizing {
            if let Some(idx) = self.tree.subtree_index(&self.me, route) {
                if idx < self.children.len() && self.children[idx] == route {
                    debug!(child = route, "finalizing; child connection closed");
                    self.children[idx] = RANK_INVALID;
                    self.n_children -= 1;
                }
            }
            return Ok(Vec::new());
        }

        if route == 0 {
            warn!(rank = self.my_rank, "connection to the root daemon lost");
            return Err(Error::RootLost);
        }

        self.repair(&[route], FaultScope::Local)
    }

    /// Reconcile a peer's reported ancestor chain against this daemon's
    /// view, inferring failures the peer must have seen.
    ///
    /// The sender of an adoption notice is not blindly trusted to be the
    /// new parent - it may know less than we do, or the notice may be
    /// stale. Instead the reported chain is brought up to date with our
    /// own fault knowledge and diffed against our record; each divergence
    /// names an ancestor that must have died. Inferred ranks are *not* left
    /// marked here - the caller runs the full repair pass for them so all
    /// propagation side effects still happen.
    ///
    /// Returns the inferred failures, empty when the notice carried
    /// nothing new. Irreconcilable chains - including any that would
    /// deepen this daemon, since depth only ever decreases - are a
    /// protocol violation and fatal.
    pub fn reconcile_adoption(&mut self, reported: &[Rank]) -> Result<Vec<Rank>> {
        let mut report: Vec<Rank> = reported.to_vec();
        if report.len() < self.ancestors.len() {
            report.resize(self.ancestors.len(), RANK_INVALID);
        }
        self.update_chain(&mut report);

        if report == self.ancestors {
            trace!("adoption notice carried no new information");
            return Ok(Vec::new());
        }

        if report.len() > self.ancestors.len() {
            warn!(
                ?report,
                ancestors = ?self.ancestors,
                "adoption notice implies a depth increase"
            );
            return Err(Error::InconsistentAncestry {
                reported: report,
                derived: self.ancestors.clone(),
            });
        }

        fn unmark(failed: &mut crate::rankset::RankSet, inferred: &[Rank]) {
            for &r in inferred {
                failed.clear(r);
            }
        }

        // Work on a copy of our chain, marking one inferred failure at a
        // time and re-deriving until the views meet
        let mut chain = self.ancestors.clone();
        let mut inferred: Vec<Rank> = Vec::new();

        let mut i = 0;
        while i < report.len() && i < chain.len() {
            let ancestor = chain[i];
            if ancestor == report[i] {
                i += 1;
                continue;
            }
            if ancestor == 0 || self.failed.contains(ancestor) {
                // No way to infer around the root or a rank already dead
                unmark(&mut self.failed, &inferred);
                return Err(Error::InconsistentAncestry {
                    reported: report,
                    derived: chain,
                });
            }
            inferred.push(ancestor);
            self.failed.set(ancestor);
            self.update_chain(&mut chain);
            // Re-check the same position against the re-derived chain
        }
        while chain.len() > report.len() {
            let ancestor = chain[report.len()];
            if ancestor == 0 || self.failed.contains(ancestor) {
                unmark(&mut self.failed, &inferred);
                return Err(Error::InconsistentAncestry {
                    reported: report,
                    derived: chain,
                });
            }
            inferred.push(ancestor);
            self.failed.set(ancestor);
            self.update_chain(&mut chain);
        }

        // Un-mark the inferred ranks: the caller's repair pass must see
        // them as fresh so the full propagation side effects execute
        unmark(&mut self.failed, &inferred);

        if chain != report {
            warn!(?report, derived = ?chain, "ancestor views cannot be reconciled");
            return Err(Error::InconsistentAncestry {
                reported: report,
                derived: chain,
            });
        }

        debug!(?inferred, "inferred failures from adoption notice");
        Ok(inferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::NextHop;

    fn router(rank: Rank) -> Router {
        Router::new(10, 2, rank).unwrap()
    }

    #[test]
    fn leaf_failure_empties_the_child_slot() {
        // Rank 5's only child is leaf 9
        let mut r = router(5);
        let reports = r.repair(&[9], FaultScope::Local).unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.failed, vec![9]);
        assert!(report.children_changed);
        assert!(!report.ancestors_changed);
        assert!(!report.parent_changed);
        assert!(!report.promoted);
        assert_eq!(report.prev_children, vec![9]);

        // 9's subtree holds nobody else: unreachable until the end of time
        assert_eq!(r.next_hop(9), NextHop::Unreachable);
        assert_eq!(r.children().count(), 0);
        assert_eq!(r.n_children(), 0);
    }

    #[test]
    fn repair_is_idempotent() {
        let mut r = router(5);
        let first = r.repair(&[9], FaultScope::Local).unwrap();
        assert_eq!(first.len(), 1);
        let second = r.repair(&[9], FaultScope::Local).unwrap();
        assert!(second.is_empty());
        let snap_before = r.snapshot();
        let third = r.repair(&[9], FaultScope::Local).unwrap();
        assert!(third.is_empty());
        assert_eq!(r.snapshot(), snap_before);
    }

    #[test]
    fn parent_substitutes_a_dead_child_with_its_successor() {
        // Rank 1's children are 3 and 5; 3's subtree also holds 7
        let mut r = router(1);
        let reports = r.repair(&[3], FaultScope::Local).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(r.children().collect::<Vec<_>>(), vec![7, 5]);
        assert_eq!(r.n_children(), 2);

        // Traffic for the dead rank's subtree flows to the successor
        assert_eq!(r.next_hop(7), NextHop::Forward(7));
        assert_eq!(r.next_hop(3), NextHop::Forward(7));
    }

    #[test]
    fn descendant_is_promoted_into_dead_ancestors_slot() {
        // Rank 7 hangs under 0 -> 1 -> 3. When 3 dies, 7 is the next
        // living rank in 3's subtree and inherits its position.
        let mut r = router(7);
        assert_eq!(r.ancestors(), &[0, 1, 3]);
        assert_eq!(r.depth(), 3);

        let reports = r.repair(&[3], FaultScope::Local).unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert!(report.promoted);
        assert!(report.ancestors_changed);
        assert!(report.parent_changed);
        assert_eq!(report.prev_ancestors, vec![0, 1, 3]);
        assert_eq!(report.prev_parent, Some(3));

        assert_eq!(r.ancestors(), &[0, 1]);
        assert_eq!(r.parent(), Some(1));
        assert_eq!(r.depth(), 2);
        // The old subtree slot has no other living occupant
        assert_eq!(r.children().count(), 0);

        // Promoted position covers the dead rank's span: 3 itself is
        // gone, everything else routes up
        assert_eq!(r.next_hop(3), NextHop::Unreachable);
        assert_eq!(r.next_hop(8), NextHop::Forward(1));
    }

    #[test]
    fn promotion_keeps_living_siblings_as_children() {
        // Rank 2's subtree: 2 -> {4 -> 8, 6}. Kill 2: rank 6 is next in
        // the right-first walk and inherits the slot, keeping 4 and 8
        // below it.
        let mut r = router(6);
        assert_eq!(r.ancestors(), &[0, 2]);

        r.repair(&[2], FaultScope::Local).unwrap();
        assert_eq!(r.ancestors(), &[0]);
        assert_eq!(r.parent(), Some(0));
        assert_eq!(r.depth(), 1);
        // 6 now occupies slot 2 and owns its child slots: 4's subtree
        // stays, 6's own old slot has no living occupant
        assert_eq!(r.children().collect::<Vec<_>>(), vec![4]);
        assert_eq!(r.next_hop(8), NextHop::Forward(4));
    }

    #[test]
    fn depth_never_increases_across_cascading_failures() {
        let mut r = router(9);
        let mut last_depth = r.depth();
        for dead in [3u64, 5, 1] {
            r.repair(&[dead], FaultScope::Local).unwrap();
            assert!(r.depth() <= last_depth, "depth grew after killing {dead}");
            last_depth = r.depth();
        }
        // 9 ends up directly under the root: 1's slot fell to 5 and then
        // to 9 itself as the deaths cascaded
        assert_eq!(r.ancestors(), &[0]);
        assert_eq!(r.parent(), Some(0));
    }

    #[test]
    fn global_scope_acknowledges_and_reports_twice() {
        let mut r = router(5);
        let reports = r.repair(&[9], FaultScope::Global).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].scope, FaultScope::Local);
        assert!(reports[0].children_changed);
        assert_eq!(reports[1].scope, FaultScope::Global);
        assert!(!reports[1].tree_changed());

        assert!(r.is_failed(9));
        assert!(r.is_globally_failed(9));
        assert!(r.unacknowledged_subtree_failures().is_empty());
    }

    #[test]
    fn global_after_local_only_acknowledges() {
        let mut r = router(5);
        r.repair(&[9], FaultScope::Local).unwrap();
        assert_eq!(r.unacknowledged_subtree_failures(), vec![9]);

        let reports = r.repair(&[9], FaultScope::Global).unwrap();
        // The local pass finds nothing fresh; only the acknowledgement
        // report comes out
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].scope, FaultScope::Global);
        assert!(r.is_globally_failed(9));
        assert!(r.unacknowledged_subtree_failures().is_empty());
    }

    #[test]
    fn root_failure_is_rejected() {
        let mut r = router(5);
        assert!(matches!(
            r.repair(&[0], FaultScope::Local),
            Err(Error::RootFailed)
        ));
    }

    #[test]
    fn losing_the_root_link_is_fatal() {
        let mut r = router(1);
        assert!(matches!(r.route_lost(0), Err(Error::RootLost)));
    }

    #[test]
    fn lost_child_during_shutdown_is_bookkeeping() {
        let mut r = router(1);
        r.begin_shutdown();
        let reports = r.route_lost(5).unwrap();
        assert!(reports.is_empty());
        assert_eq!(r.children().collect::<Vec<_>>(), vec![3]);
        assert!(!r.is_failed(5));
    }

    #[test]
    fn lost_route_repairs_when_not_finalizing() {
        let mut r = router(1);
        let reports = r.route_lost(5).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(r.is_failed(5));
        // 9 inherits 5's slot
        assert_eq!(r.children().collect::<Vec<_>>(), vec![3, 9]);
    }

    #[test]
    fn adoption_notice_with_no_news_is_ignored() {
        // Rank 9's chain is [0, 1, 5]; its parent 5 reports exactly that
        let mut r = router(9);
        let inferred = r.reconcile_adoption(&[0, 1, 5]).unwrap();
        assert!(inferred.is_empty());
        assert_eq!(r.ancestors(), &[0, 1, 5]);
    }

    #[test]
    fn adoption_notice_infers_a_dead_ancestor() {
        // Rank 9 records [0, 1, 5]. Rank 5, promoted into 1's slot after
        // 1 died, announces its chain as [0, 5]. The one-entry-shorter
        // report forces exactly one inference: 1 is dead.
        let mut r = router(9);
        let inferred = r.reconcile_adoption(&[0, 5]).unwrap();
        assert_eq!(inferred, vec![1]);
        // Reconciliation itself leaves no marks; the repair pass owns the
        // side effects
        assert!(!r.is_failed(1));

        let reports = r.repair(&inferred, FaultScope::Local).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(r.ancestors(), &[0, 5]);
        assert_eq!(r.parent(), Some(5));
    }

    #[test]
    fn adoption_notice_agreeing_after_known_faults_is_quiet() {
        // Once 9 has repaired around 1's death itself, the same notice
        // carries nothing new.
        let mut r = router(9);
        r.repair(&[1], FaultScope::Local).unwrap();
        assert_eq!(r.ancestors(), &[0, 5]);
        let inferred = r.reconcile_adoption(&[0, 5]).unwrap();
        assert!(inferred.is_empty());
    }

    #[test]
    fn adoption_notice_implying_deeper_position_is_fatal() {
        // Rank 1 sits at depth 1; a chain that would put it at depth 2 is
        // an invariant violation
        let mut r = router(1);
        assert!(matches!(
            r.reconcile_adoption(&[0, 2]),
            Err(Error::InconsistentAncestry { .. })
        ));
    }

    #[test]
    fn converged_failure_knowledge_keeps_routing_consistent() {
        // Give every daemon the same failure set and check all live pairs
        // still route to each other
        let n = 10u64;
        let dead = [3u64, 9];
        let mut routers: Vec<Router> = (0..n).map(|r| Router::new(n, 2, r).unwrap()).collect();
        for r in routers.iter_mut() {
            r.repair(&dead, FaultScope::Local).unwrap();
        }

        let live: Vec<Rank> = (0..n).filter(|r| !dead.contains(r)).collect();
        for &src in &live {
            for &dst in &live {
                let mut at = src;
                let mut hops = 0;
                while at != dst {
                    match routers[at as usize].next_hop(dst) {
                        NextHop::Forward(next) => {
                            assert!(!dead.contains(&next), "routed through dead rank {next}");
                            at = next;
                        }
                        other => panic!("route {src}->{dst} stalled at {at}: {other:?}"),
                    }
                    hops += 1;
                    assert!(hops <= 8, "route {src}->{dst} too long");
                }
            }
        }
    }
}
